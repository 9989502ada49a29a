use quarry_codec::CodecError;
use quarry_ledger::RepositoryError;
use thiserror::Error as ThisError;

pub type Result<T, E = AtError> = ::core::result::Result<T, E>;

/// Host-level failure during block AT processing. The VM itself never
/// raises these; program-level problems become machine flags instead.
#[derive(Debug, Clone, PartialEq, Eq, ThisError)]
pub enum AtError {
    #[error("repository: {0}")]
    Repository(#[from] RepositoryError),
    #[error("invalid machine state blob: {0}")]
    InvalidState(#[from] CodecError),
}
