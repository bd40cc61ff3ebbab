pub type Result<T, E = BencodeError> = std::result::Result<T, E>;

/// Error type returned by the strict bencode decoder.
///
/// Any of these on a network surface means the remote sent something
/// malformed; the offending message (or peer) is dropped, never the task.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum BencodeError {
    #[error("input ended before the value was complete")]
    Truncated,

    #[error("bytes remain after the value ended")]
    TrailingBytes,

    #[error("unexpected byte {0:#04x}")]
    UnexpectedByte(u8),

    #[error("invalid integer encoding")]
    InvalidInt,

    #[error("integer does not fit in 64 bits")]
    IntOverflow,

    #[error("nesting exceeds the depth limit")]
    TooDeep,
}
