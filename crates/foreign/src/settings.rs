use std::fs;
use std::path::Path;

use bitcoin::Amount;
use serde::{Deserialize, Serialize};

use crate::{ForeignChain, ForeignError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkChoice {
    Main,
    Test,
}

/// Environment selection for the swap tools: which network, where the
/// external-chain provider lives, and the default fee.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub network: NetworkChoice,
    pub provider_url: String,
    /// Satoshis per kilobyte for wallet spends.
    pub fee_per_kb: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            network: NetworkChoice::Main,
            provider_url: "https://blockstream.info/api".to_owned(),
            fee_per_kb: 10_000,
        }
    }
}

impl Settings {
    pub fn load(path: &Path) -> Result<Self> {
        let body = fs::read_to_string(path).map_err(|error| {
            ForeignError::invalid(format!("settings {}: {error}", path.display()))
        })?;
        serde_json::from_str(&body).map_err(|error| {
            ForeignError::invalid(format!("settings {}: {error}", path.display()))
        })
    }

    pub fn chain(&self) -> ForeignChain {
        let mut chain = match self.network {
            NetworkChoice::Main => ForeignChain::bitcoin(),
            NetworkChoice::Test => ForeignChain::bitcoin_testnet(),
        };
        chain.fee_per_kb = Amount::from_sat(self.fee_per_kb);
        chain
    }
}
