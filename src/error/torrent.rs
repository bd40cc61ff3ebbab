pub type Result<T, E = TorrentError> = std::result::Result<T, E>;

/// Error type for a torrent task.
#[derive(Debug, thiserror::Error)]
pub enum TorrentError {
    #[error("channel error")]
    /// A channel between the torrent and another component died.
    Channel,

    #[error("torrent paused by durable disk write failure")]
    /// The disk task reported a write, fsync or rename failure. The torrent
    /// stops issuing requests until the operator intervenes; verified
    /// pieces remain recoverable from the checkpoint.
    DiskFailure,

    #[error("metadata could not be obtained from any peer")]
    /// Every candidate peer failed or timed out during the ut_metadata
    /// exchange.
    MetadataUnavailable,

    #[error("{0}")]
    /// An IO error occurred, e.g. while binding the listen socket.
    Io(std::io::Error),
}

impl From<std::io::Error> for TorrentError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for TorrentError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Self::Channel
    }
}
