use core::str::FromStr;

use bitcoin::{Address, Amount, Network, address::NetworkUnchecked, bip32::Xpriv};

/// Profile of a supported external chain.
///
/// One struct parameterised by values instead of an inheritance tree:
/// everything the swap flows need to know about "a Bitcoin-like chain"
/// lives here.
#[derive(Debug, Clone)]
pub struct ForeignChain {
    pub name: &'static str,
    pub network: Network,
    /// Default relay fee for wallet spends.
    pub fee_per_kb: Amount,
    /// Flat fee budgeted for P2SH (HTLC) spends.
    pub p2sh_fee: Amount,
}

impl ForeignChain {
    pub const fn bitcoin() -> Self {
        Self {
            name: "Bitcoin",
            network: Network::Bitcoin,
            fee_per_kb: Amount::from_sat(10_000),
            p2sh_fee: Amount::from_sat(10_000),
        }
    }

    pub const fn bitcoin_testnet() -> Self {
        Self {
            name: "Bitcoin testnet",
            network: Network::Testnet,
            fee_per_kb: Amount::from_sat(10_000),
            p2sh_fee: Amount::from_sat(10_000),
        }
    }

    pub fn fee_per_byte(&self) -> Amount {
        self.fee_per_kb / 1000
    }

    pub fn is_valid_address(&self, address: &str) -> bool {
        address
            .parse::<Address<NetworkUnchecked>>()
            .is_ok_and(|parsed| parsed.require_network(self.network).is_ok())
    }

    /// Whether `key` is an extended private key for this chain's network.
    pub fn is_valid_wallet_key(&self, key: &str) -> bool {
        Xpriv::from_str(key).is_ok_and(|xprv| xprv.network == self.network.into())
    }
}
