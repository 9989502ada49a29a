use thiserror::Error as ThisError;

use crate::provider::ProviderError;

pub type Result<T, E = ForeignError> = ::core::result::Result<T, E>;

#[derive(Debug, ThisError)]
pub enum ForeignError {
    /// Malformed keys, addresses, or hashes. User-facing and local.
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// A protocol safety check failed (derived P2SH mismatch, refund
    /// before lock time, unexpected UTXO set). Never retried.
    #[error("safety check failed: {0}")]
    SafetyViolation(String),
    /// Transport or availability failure against the external node.
    #[error("foreign blockchain: {0}")]
    Provider(#[from] ProviderError),
    /// Internal transaction-construction failure.
    #[error("transaction construction: {0}")]
    Construction(String),
}

impl ForeignError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    pub fn safety(message: impl Into<String>) -> Self {
        Self::SafetyViolation(message.into())
    }
}
