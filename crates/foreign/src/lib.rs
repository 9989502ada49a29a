//! Cross-chain atomic-swap support for a Bitcoin-like external chain.
//!
//! HTLC redeem scripts expressed as P2SH, the BIP32 key-chain wallet that
//! funds and recovers them, an opaque provider interface to the external
//! node, and the refund/redeem orchestration with its median-time-past
//! safety gate.

mod chain;
mod error;
mod esplora;
mod htlc;
pub mod provider;
mod settings;
mod swap;
mod wallet;

pub use self::{
    chain::ForeignChain,
    error::{ForeignError, Result},
    esplora::EsploraProvider,
    htlc::{HtlcParams, SECRET_LENGTH},
    settings::{NetworkChoice, Settings},
    swap::{
        RedeemRequest, RefundRequest, SwapOutcome, median_time_past, redeem_htlc, refund_htlc,
        trim_private_key,
    },
    wallet::{KeyChainWallet, LOOKAHEAD_INCREMENT, LOOKAHEAD_START, WalletUtxo},
};
