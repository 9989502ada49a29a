//! The AT (Automated Transaction) execution engine.
//!
//! A deterministic, step-metered virtual machine that runs on-chain
//! programs. Each block, the runner loads every eligible AT, executes it
//! against a block-scoped platform API, collects the transactions it
//! emits, and debits execution fees. Determinism is absolute: no wall
//! clock, no host exceptions across the VM boundary, all randomness
//! derived from block signatures.

mod api;
mod error;
mod function;
mod opcode;
mod runner;
mod state;

pub use self::{
    api::{AtContext, BlockApi, BlockContext, PlatformApi},
    error::{AtError, Result},
    function::FunctionCode,
    opcode::OpCode,
    runner::{AtConfig, RoundOutcome, run_block_ats},
    state::{MachineFlags, MachineState},
};
