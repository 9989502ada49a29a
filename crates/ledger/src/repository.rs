use quarry_codec::CodecError;
use thiserror::Error as ThisError;

use crate::{Address, AtData, BlockData, BlockSummary, TransactionData};

pub type Result<T, E = RepositoryError> = ::core::result::Result<T, E>;

/// Failure to read or write ledger state. Fatal for the block being
/// applied; the caller rejects the block.
#[derive(Debug, Clone, PartialEq, Eq, ThisError)]
pub enum RepositoryError {
    #[error("storage: {0}")]
    Storage(String),
    #[error("corrupt ledger data: {0}")]
    Corrupt(#[from] CodecError),
}

/// Abstract access to chain state.
///
/// Reads are immutable for the duration of a VM round. The only write is
/// the AT state blob; emitted transactions and balance changes are
/// collected by the runner and applied by the block assembler.
pub trait Repository {
    fn chain_height(&self) -> Result<u32>;

    fn last_block(&self) -> Result<BlockData>;

    fn block_by_height(&self, height: u32) -> Result<Option<BlockData>>;

    /// Summaries for heights `first..=last`, ascending.
    fn block_summaries(&self, first: u32, last: u32) -> Result<Vec<BlockSummary>>;

    /// Transaction at a packed position. `sequence` is 1-based within the
    /// block; `(height, 0)` denotes the block itself and never resolves.
    fn transaction_at(&self, height: u32, sequence: u32) -> Result<Option<TransactionData>>;

    fn transaction_by_signature(&self, signature: &[u8; 64]) -> Result<Option<TransactionData>>;

    /// All transactions of a block in sequence order.
    fn transactions_in_block(&self, height: u32) -> Result<Vec<TransactionData>>;

    fn account_last_reference(&self, address: &Address) -> Result<Option<[u8; 64]>>;

    fn account_balance(&self, address: &Address, asset_id: u64) -> Result<u64>;

    /// ATs eligible to run at `height`, ascending by address.
    fn ats_active_at(&self, height: u32) -> Result<Vec<AtData>>;

    fn at_by_address(&self, address: &Address) -> Result<Option<AtData>>;

    fn save_at(&mut self, at: &AtData) -> Result<()>;
}
