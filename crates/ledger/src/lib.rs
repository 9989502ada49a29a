//! Ledger data model and repository interface.
//!
//! The repository is the node's only view of persistent chain state. The
//! VM and the AT runner read through it; writes are limited to AT state
//! blobs and are applied atomically with block application by the caller.
//! Consensus-critical byte layouts (the transaction wire format) are
//! hand-encoded here through `quarry-codec`.

mod account;
mod at;
mod block;
pub mod memory;
mod repository;
mod timestamp;
mod transaction;

pub use self::{
    account::Address,
    at::AtData,
    block::{BlockData, BlockSummary},
    repository::{Repository, RepositoryError, Result},
    timestamp::AtTimestamp,
    transaction::{
        NO_GROUP, TYPE_AT, TYPE_MESSAGE, TYPE_PAYMENT, TransactionData, TransactionKind,
    },
};
