//! In-memory repository, used by the engine tests and by standalone
//! tools that replay small chain fragments.

use std::collections::{BTreeMap, HashMap};

use crate::{
    Address, AtData, BlockData, BlockSummary, Repository, RepositoryError, Result,
    TransactionData,
};

#[derive(Debug, Clone, Default)]
struct AccountState {
    balances: HashMap<u64, u64>,
    last_reference: Option<[u8; 64]>,
}

/// A whole chain fragment held in maps. Blocks are appended in height
/// order; helper methods mutate account state directly so tests can set
/// up exactly the ledger they need.
#[derive(Debug, Clone, Default)]
pub struct MemoryRepository {
    blocks: BTreeMap<u32, BlockData>,
    transactions: BTreeMap<u32, Vec<TransactionData>>,
    by_signature: HashMap<[u8; 64], (u32, u32)>,
    accounts: HashMap<Address, AccountState>,
    ats: BTreeMap<Address, AtData>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a block at the next height and index its transactions.
    pub fn push_block(&mut self, signature: [u8; 64], transactions: Vec<TransactionData>) -> u32 {
        let height = self.blocks.last_key_value().map_or(1, |(h, _)| h + 1);
        for (index, tx) in transactions.iter().enumerate() {
            self.by_signature
                .insert(tx.signature, (height, index as u32 + 1));
        }
        self.blocks.insert(height, BlockData { height, signature });
        self.transactions.insert(height, transactions);
        height
    }

    /// Append transactions to an existing block, keeping the signature
    /// index consistent. Used when AT emissions join the block stream.
    pub fn append_transactions(&mut self, height: u32, transactions: Vec<TransactionData>) {
        let block_txs = self.transactions.entry(height).or_default();
        for tx in transactions {
            self.by_signature
                .insert(tx.signature, (height, block_txs.len() as u32 + 1));
            block_txs.push(tx);
        }
    }

    pub fn set_balance(&mut self, address: &Address, asset_id: u64, balance: u64) {
        self.accounts
            .entry(address.clone())
            .or_default()
            .balances
            .insert(asset_id, balance);
    }

    pub fn set_last_reference(&mut self, address: &Address, reference: [u8; 64]) {
        self.accounts
            .entry(address.clone())
            .or_default()
            .last_reference = Some(reference);
    }

    pub fn insert_at(&mut self, at: AtData) {
        self.ats.insert(at.address.clone(), at);
    }
}

impl Repository for MemoryRepository {
    fn chain_height(&self) -> Result<u32> {
        Ok(self.blocks.last_key_value().map_or(0, |(h, _)| *h))
    }

    fn last_block(&self) -> Result<BlockData> {
        self.blocks
            .last_key_value()
            .map(|(_, block)| block.clone())
            .ok_or_else(|| RepositoryError::Storage("empty chain".into()))
    }

    fn block_by_height(&self, height: u32) -> Result<Option<BlockData>> {
        Ok(self.blocks.get(&height).cloned())
    }

    fn block_summaries(&self, first: u32, last: u32) -> Result<Vec<BlockSummary>> {
        Ok(self
            .blocks
            .range(first..=last)
            .map(|(_, block)| BlockSummary::from(block))
            .collect())
    }

    fn transaction_at(&self, height: u32, sequence: u32) -> Result<Option<TransactionData>> {
        if sequence == 0 {
            return Ok(None);
        }
        Ok(self
            .transactions
            .get(&height)
            .and_then(|txs| txs.get(sequence as usize - 1))
            .cloned())
    }

    fn transaction_by_signature(&self, signature: &[u8; 64]) -> Result<Option<TransactionData>> {
        let Some((height, sequence)) = self.by_signature.get(signature) else {
            return Ok(None);
        };
        self.transaction_at(*height, *sequence)
    }

    fn transactions_in_block(&self, height: u32) -> Result<Vec<TransactionData>> {
        Ok(self.transactions.get(&height).cloned().unwrap_or_default())
    }

    fn account_last_reference(&self, address: &Address) -> Result<Option<[u8; 64]>> {
        Ok(self
            .accounts
            .get(address)
            .and_then(|account| account.last_reference))
    }

    fn account_balance(&self, address: &Address, asset_id: u64) -> Result<u64> {
        Ok(self
            .accounts
            .get(address)
            .and_then(|account| account.balances.get(&asset_id))
            .copied()
            .unwrap_or(0))
    }

    fn ats_active_at(&self, height: u32) -> Result<Vec<AtData>> {
        // BTreeMap keys give the canonical address-ascending order.
        Ok(self
            .ats
            .values()
            .filter(|at| at.creation_height < height)
            .cloned()
            .collect())
    }

    fn at_by_address(&self, address: &Address) -> Result<Option<AtData>> {
        Ok(self.ats.get(address).cloned())
    }

    fn save_at(&mut self, at: &AtData) -> Result<()> {
        self.ats.insert(at.address.clone(), at.clone());
        Ok(())
    }
}
