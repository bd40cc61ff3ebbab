pub type Result<T, E = CheckpointError> = std::result::Result<T, E>;

/// Error type for checkpoint persistence.
///
/// Load failures are validation errors surfaced to the caller before the
/// session starts; save failures are reported on the alert channel and the
/// previous checkpoint file is left untouched (the write is atomic).
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("checkpoint file has an unknown magic or format code")]
    /// The file does not look like a checkpoint in either format.
    InvalidFormat,

    #[error("unsupported checkpoint version {0}")]
    /// The binary header's version is newer than this build understands.
    UnsupportedVersion(u8),

    #[error("checkpoint contents failed validation")]
    /// Fields are missing or inconsistent, e.g. a verified piece index at
    /// or above `total_pieces`.
    InvalidContents,

    #[error("{0}")]
    /// The JSON body failed to parse or serialize.
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    /// The binary body failed to parse.
    Bencode(#[from] crate::error::BencodeError),

    #[error("{0}")]
    /// An IO error while reading, writing, fsyncing or renaming.
    Io(#[from] std::io::Error),
}
