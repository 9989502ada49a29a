use thiserror::Error as ThisError;

pub type Result<T, E = CodecError> = ::core::result::Result<T, E>;

#[derive(Debug, Clone, PartialEq, Eq, ThisError)]
pub enum CodecError {
    #[error("bad base58")]
    BadBase58,
    #[error("bad checksum")]
    BadChecksum,
    #[error("truncated input: wanted {wanted} more bytes, had {available}")]
    Truncated { wanted: usize, available: usize },
    #[error("trailing bytes after end of structure")]
    TrailingBytes,
    #[error("invalid address")]
    InvalidAddress,
    #[error("length out of range")]
    LengthOutOfRange,
    #[error("invalid field value")]
    InvalidValue,
}
