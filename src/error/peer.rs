use crate::blockinfo::BlockInfo;

pub type Result<T, E = PeerError> = std::result::Result<T, E>;

/// Error type for a session with a single peer.
///
/// Protocol violations disconnect the offending peer; the torrent and the
/// rest of the swarm continue undisturbed.
#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    #[error("peer connection timeout")]
    /// The connection attempt or the handshake exchange timed out.
    ConnectTimeout,

    #[error("channel error")]
    /// The channel on which the session communicated with its torrent died.
    Channel,

    #[error("handshake info hash mismatch")]
    /// The info hash in the peer's handshake does not identify the torrent
    /// this session belongs to. The connection is closed immediately.
    InfoHashMismatch,

    #[error("peer sent an invalid bitfield")]
    /// Bitfields may only be sent right after the handshake and must match
    /// the torrent's piece count.
    InvalidBitfield,

    #[error("peer sent block {0} that was not requested")]
    /// An unsolicited or duplicate block. The block is dropped; repeated
    /// offenses disconnect the peer.
    UnsolicitedBlock(BlockInfo),

    #[error("peer sent an invalid message")]
    /// A frame with an unknown fixed message id, an impossible length
    /// prefix, or a payload that doesn't parse.
    InvalidMessage,

    #[error("peer does not support the extension protocol")]
    /// An extension message was needed (e.g. ut_metadata) but the peer did
    /// not advertise BEP 10 support in its handshake.
    NoExtensionSupport,

    #[error("inactivity timeout")]
    /// The peer has not sent anything (not even keep-alives) for too long.
    InactivityTimeout,

    #[error("{0}")]
    /// An IO error on the socket.
    Io(std::io::Error),
}

impl From<std::io::Error> for PeerError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for PeerError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Self::Channel
    }
}
