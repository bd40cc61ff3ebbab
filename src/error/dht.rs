use crate::error::BencodeError;

pub type Result<T, E = DhtError> = std::result::Result<T, E>;

/// Error type for DHT operations.
///
/// None of these are fatal to the DHT task. Timeouts and remote errors
/// decrement the health of the node involved; local validation failures
/// are reported to the caller of the operation.
#[derive(Debug, thiserror::Error)]
pub enum DhtError {
    #[error("query timed out")]
    /// No response arrived within the per-query window.
    Timeout,

    #[error("lookup exhausted without completing")]
    /// The iterative lookup ran out of nodes or hit its global deadline.
    LookupFailed,

    #[error("{0}")]
    /// A KRPC frame failed to decode.
    Bencode(#[from] BencodeError),

    #[error("malformed KRPC message")]
    /// The frame was valid bencode but not a valid KRPC query or response.
    InvalidMessage,

    #[error("remote error {code}: {message}")]
    /// The remote answered with a KRPC error frame.
    Remote { code: i64, message: String },

    #[error("encoded value exceeds the 1000 byte storage limit")]
    /// BEP 44 caps the bencoded storage value; the item is rejected before
    /// transmission.
    ValueTooLarge,

    #[error("invalid signature on mutable item")]
    /// A BEP 44 mutable item's ed25519 signature did not verify.
    InvalidSignature,

    #[error("sequence number not newer than the stored item")]
    /// A mutable store carried a `seq` lower than or equal to what we
    /// already hold.
    StaleSequence,

    #[error("invalid or expired write token")]
    /// The token in an announce_peer or put did not match any recent
    /// get_peers/get we issued to that node.
    InvalidToken,

    #[error("node is read-only")]
    /// This node was configured read-only (BEP 43) and refuses stores.
    ReadOnly,

    #[error("{0}")]
    /// An IO error on the UDP socket.
    Io(#[from] std::io::Error),
}
