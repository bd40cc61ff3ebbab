pub type Result<T, E = TrackerError> = std::result::Result<T, E>;

/// Error type for tracker announces.
///
/// All variants are transient from the torrent's point of view: announces
/// are retried on the next schedule, and a tracker is only dropped after
/// repeated failures.
#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    #[error("{0}")]
    /// The HTTP request failed (connection, TLS, non-2xx status).
    Http(#[from] reqwest::Error),

    #[error("announce timed out")]
    /// The tracker did not respond within the configured window.
    Timeout,

    #[error("unsupported tracker URL scheme {0}")]
    /// Only http(s) and udp tracker URLs are supported.
    UnsupportedScheme(String),

    #[error("invalid tracker response: {0}")]
    /// The tracker's bencoded response failed to parse.
    BencodeDe(#[from] serde_bencode::Error),

    #[error("tracker responded with failure: {0}")]
    /// The tracker processed the announce but refused it.
    Failure(String),

    #[error("invalid udp tracker response")]
    /// A BEP 15 packet was too short, carried the wrong action or an
    /// unknown transaction id.
    InvalidUdpResponse,

    #[error("{0}")]
    /// An IO error on the UDP socket.
    Io(#[from] std::io::Error),
}
