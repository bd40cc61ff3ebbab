/// Error type returned when a torrent file fails to parse or validate.
#[derive(Debug, thiserror::Error)]
pub enum MetainfoError {
    #[error("{0}")]
    /// The bencode layer rejected the input.
    BencodeDe(#[from] serde_bencode::Error),

    #[error("invalid metainfo")]
    /// The bencode was well formed but the contents violate the metainfo
    /// rules: pieces not a multiple of 20 bytes, both `length` and `files`
    /// present, empty or absolute paths, a symlink attribute without
    /// a target, or a per-file sha1 that isn't 20 bytes.
    InvalidMetainfo,

    #[error("info dictionary hash does not match the expected info hash")]
    /// Metadata obtained via BEP 9 did not hash to the magnet's info hash.
    InfoHashMismatch,

    #[error("{0}")]
    /// A tracker URL failed to parse.
    InvalidTrackerUrl(#[from] url::ParseError),
}

/// Error type returned when a magnet URI fails to parse.
#[derive(Debug, thiserror::Error)]
pub enum MagnetError {
    #[error("not a magnet URI")]
    /// The input does not start with the `magnet:` scheme.
    NotMagnet,

    #[error("magnet URI carries no usable info hash")]
    /// The `xt` parameter is missing, is not `urn:btih:...`, or its digest
    /// is neither 40 hex nor 32 base32 characters.
    InvalidInfoHash,

    #[error("{0}")]
    /// The URI itself failed to parse.
    InvalidUrl(#[from] url::ParseError),
}
