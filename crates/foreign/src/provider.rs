//! Opaque access to an external-chain node.

use bitcoin::{Address, Amount, OutPoint, ScriptBuf, Transaction, Txid};
use thiserror::Error as ThisError;

#[derive(Debug, Clone, ThisError)]
pub enum ProviderError {
    #[error("transport: {0}")]
    Transport(String),
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("rejected: {0}")]
    Rejected(String),
}

/// An unspent output as the provider reports it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Utxo {
    pub outpoint: OutPoint,
    pub value: Amount,
    /// Confirmation height, `None` while in the mempool.
    pub height: Option<u32>,
    pub script_pubkey: ScriptBuf,
}

/// Client for the external chain. Implementations own their timeouts and
/// retries; callers treat every method as a single fallible round trip.
/// Must be safe to share across unrelated swaps.
pub trait BlockchainProvider: Send + Sync {
    fn height(&self) -> Result<u32, ProviderError>;

    /// The latest `count` raw block headers, newest first. Headers are
    /// the legacy 80-byte format.
    fn block_headers(&self, count: usize) -> Result<Vec<Vec<u8>>, ProviderError>;

    fn address_utxos(&self, address: &Address) -> Result<Vec<Utxo>, ProviderError>;

    /// Transactions that ever touched `address`. Emptiness is the
    /// "never used" signal for key-chain discovery.
    fn address_history(&self, address: &Address) -> Result<Vec<Txid>, ProviderError>;

    fn transaction(&self, txid: &Txid) -> Result<Option<Transaction>, ProviderError>;

    fn broadcast(&self, tx: &Transaction) -> Result<Txid, ProviderError>;
}

/// In-memory provider for tests and dry runs.
#[cfg(any(test, feature = "testing"))]
pub use self::mock::MockProvider;

#[cfg(any(test, feature = "testing"))]
mod mock {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::{BlockchainProvider, ProviderError, Utxo};
    use bitcoin::{Address, Transaction, Txid};

    #[derive(Debug, Default)]
    pub struct MockProvider {
        pub height: u32,
        pub headers: Vec<Vec<u8>>,
        utxos: HashMap<String, Vec<Utxo>>,
        history: HashMap<String, Vec<Txid>>,
        transactions: HashMap<Txid, Transaction>,
        broadcasts: Mutex<Vec<Transaction>>,
        pub fail_broadcast: bool,
    }

    impl MockProvider {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn add_utxo(&mut self, address: &Address, utxo: Utxo) {
            self.utxos.entry(address.to_string()).or_default().push(utxo);
        }

        pub fn add_history(&mut self, address: &Address, txid: Txid) {
            self.history
                .entry(address.to_string())
                .or_default()
                .push(txid);
        }

        pub fn add_transaction(&mut self, tx: Transaction) {
            self.transactions.insert(tx.compute_txid(), tx);
        }

        /// Headers with the given timestamps at byte offset 68, newest
        /// first, zero-filled elsewhere.
        pub fn with_header_timestamps(timestamps: &[u32]) -> Self {
            let headers = timestamps
                .iter()
                .map(|ts| {
                    let mut header = vec![0u8; 80];
                    header[68..72].copy_from_slice(&ts.to_le_bytes());
                    header
                })
                .collect();
            Self {
                headers,
                ..Self::default()
            }
        }

        pub fn broadcasts(&self) -> Vec<Transaction> {
            self.broadcasts.lock().unwrap_or_else(|e| e.into_inner()).clone()
        }
    }

    impl BlockchainProvider for MockProvider {
        fn height(&self) -> Result<u32, ProviderError> {
            Ok(self.height)
        }

        fn block_headers(&self, count: usize) -> Result<Vec<Vec<u8>>, ProviderError> {
            Ok(self.headers.iter().take(count).cloned().collect())
        }

        fn address_utxos(&self, address: &Address) -> Result<Vec<Utxo>, ProviderError> {
            Ok(self
                .utxos
                .get(&address.to_string())
                .cloned()
                .unwrap_or_default())
        }

        fn address_history(&self, address: &Address) -> Result<Vec<Txid>, ProviderError> {
            Ok(self
                .history
                .get(&address.to_string())
                .cloned()
                .unwrap_or_default())
        }

        fn transaction(&self, txid: &Txid) -> Result<Option<Transaction>, ProviderError> {
            Ok(self.transactions.get(txid).cloned())
        }

        fn broadcast(&self, tx: &Transaction) -> Result<Txid, ProviderError> {
            if self.fail_broadcast {
                return Err(ProviderError::Transport("connection reset".into()));
            }
            self.broadcasts
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(tx.clone());
            Ok(tx.compute_txid())
        }
    }
}
