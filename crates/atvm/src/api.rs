use quarry_codec::{
    hash::{sha192, sha256},
    is_valid_address,
};
use quarry_ledger::{
    Address, AtTimestamp, NO_GROUP, Repository, RepositoryError, TYPE_AT, TYPE_MESSAGE,
    TYPE_PAYMENT, TransactionData, TransactionKind,
};
use tracing::warn;

use crate::{runner::AtConfig, state::MachineState};

/// The deterministic callback surface the VM dispatches into.
///
/// Infallible by contract: failures become machine flags or sentinel
/// values, never host errors, because consensus cannot tolerate
/// host-dependent exception flow.
pub trait PlatformApi {
    fn current_block_height(&self) -> u32;

    fn at_creation_block_height(&self) -> u32;

    /// A1 ← previous height; A2..A4 ← SHA-192 of the previous block's
    /// signature.
    fn put_previous_block_hash_into_a(&mut self, state: &mut MachineState);

    /// Scan forward from just after `timestamp` for the first transaction
    /// addressed to this AT. On a hit A1 holds the packed position and
    /// A2..A4 its signature fingerprint; on exhaustion A is zeroed.
    fn put_transaction_after_timestamp_into_a(
        &mut self,
        timestamp: AtTimestamp,
        state: &mut MachineState,
    );

    fn type_of_transaction_in_a(&mut self, state: &mut MachineState) -> u64;

    fn amount_of_transaction_in_a(&mut self, state: &mut MachineState) -> u64;

    fn timestamp_of_transaction_in_a(&mut self, state: &mut MachineState) -> u64;

    /// Two-phase randomness. `None` means the machine was put to sleep;
    /// the same call re-executes one block later and yields the value.
    fn generate_random_using_transaction_in_a(&mut self, state: &mut MachineState) -> Option<u64>;

    fn put_message_from_transaction_in_a_into_b(&mut self, state: &mut MachineState);

    /// B ← 32-byte public key of the transaction's sender. The key, not
    /// the address: a key subsumes the address and permits signature
    /// verification later.
    fn put_address_from_transaction_in_a_into_b(&mut self, state: &mut MachineState);

    fn put_creator_address_into_b(&mut self, state: &mut MachineState);

    fn current_balance(&self) -> u64;

    fn pay_amount_to_b(&mut self, amount: u64, state: &MachineState);

    fn pay_all_to_b(&mut self, state: &MachineState);

    fn pay_previous_to_b(&mut self, state: &MachineState);

    /// Emit the contents of A as a message to the account in B.
    fn message_a_to_b(&mut self, state: &MachineState);

    fn add_minutes_to_timestamp(&self, timestamp: AtTimestamp, minutes: u64) -> AtTimestamp;

    /// Final refund of the remaining balance to the AT's creator.
    fn on_finished(&mut self, amount: u64);
}

/// Identity of the AT a round is running for.
#[derive(Debug, Clone)]
pub struct AtContext {
    pub address: Address,
    pub creator_public_key: [u8; 32],
    pub creation_height: u32,
    pub asset_id: u64,
}

/// The block a round is running inside.
#[derive(Debug, Clone)]
pub struct BlockContext {
    pub height: u32,
    /// This block's own signature. Entropy source for the resumed phase
    /// of `generate_random`: a sleeping AT wakes inside a block whose
    /// signature did not exist when it went to sleep.
    pub block_signature: [u8; 64],
    pub previous_block_signature: [u8; 64],
}

/// Block-scoped [`PlatformApi`] implementation backed by the repository.
///
/// Collects emitted transactions and tracks the AT's accessible balance
/// as payments are made. Repository failures are recorded and surface to
/// the runner after the round; the VM only ever sees its fatal flag.
pub struct BlockApi<'a> {
    repo: &'a dyn Repository,
    block: &'a BlockContext,
    at: &'a AtContext,
    config: &'a AtConfig,
    balance: u64,
    base_reference: [u8; 64],
    last_emitted_signature: Option<[u8; 64]>,
    next_sequence: u32,
    emitted: Vec<TransactionData>,
    host_error: Option<RepositoryError>,
}

impl<'a> BlockApi<'a> {
    /// `sequence_base` is the number of transactions already part of the
    /// block, earlier ATs' emissions included; emission timestamps
    /// continue that 1-based numbering.
    pub fn new(
        repo: &'a dyn Repository,
        block: &'a BlockContext,
        at: &'a AtContext,
        config: &'a AtConfig,
        balance: u64,
        base_reference: [u8; 64],
        sequence_base: u32,
    ) -> Self {
        Self {
            repo,
            block,
            at,
            config,
            balance,
            base_reference,
            last_emitted_signature: None,
            next_sequence: sequence_base + 1,
            emitted: Vec::new(),
            host_error: None,
        }
    }

    pub const fn balance(&self) -> u64 {
        self.balance
    }

    /// (emissions, remaining balance, host error), ending the round.
    pub fn into_outcome(self) -> (Vec<TransactionData>, u64, Option<RepositoryError>) {
        (self.emitted, self.balance, self.host_error)
    }

    fn host_fail(&mut self, state: &mut MachineState, error: RepositoryError) {
        warn!(at = %self.at.address, %error, "repository failure during AT round");
        if self.host_error.is_none() {
            self.host_error = Some(error);
        }
        state.set_fatal();
    }

    /// Re-resolve the transaction addressed by A1 and re-verify that its
    /// signature still fingerprints to A2..A4. Any mismatch is fatal for
    /// the round: A is the canonical identity of "the loaded transaction"
    /// and must never be trusted without this check.
    fn transaction_in_a(&mut self, state: &mut MachineState) -> Option<TransactionData> {
        let position = AtTimestamp::from_packed(state.a()[0]);
        let found = match self
            .repo
            .transaction_at(position.height(), position.sequence())
        {
            Ok(found) => found,
            Err(error) => {
                self.host_fail(state, error);
                return None;
            }
        };
        let Some(tx) = found else {
            state.set_fatal();
            return None;
        };
        if state.a_fingerprint() != sha192(&tx.signature) {
            state.set_fatal();
            return None;
        }
        Some(tx)
    }

    /// Resolve the account B designates: a `Q`-prefixed, NUL-terminated
    /// valid address is taken verbatim, anything else is a 32-byte
    /// public key.
    fn account_from_b(&self, state: &MachineState) -> Address {
        let bytes = state.b_bytes();
        if bytes[0] == b'Q' {
            let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
            if let Ok(text) = core::str::from_utf8(&bytes[..end]) {
                if is_valid_address(text) {
                    if let Ok(address) = text.parse() {
                        return address;
                    }
                }
            }
        }
        Address::from_public_key(&bytes)
    }

    fn emit(&mut self, kind: TransactionKind) {
        let timestamp = AtTimestamp::new(self.block.height, self.next_sequence);
        let reference = self.last_emitted_signature.unwrap_or(self.base_reference);
        let mut tx = TransactionData {
            kind,
            timestamp,
            group_id: NO_GROUP,
            reference,
            creator_public_key: self.config.system_public_key,
            fee: 0,
            signature: [0u8; 64],
        };
        tx.apply_at_signature();
        self.last_emitted_signature = Some(tx.signature);
        self.next_sequence += 1;
        if let Some(amount) = tx.kind.amount() {
            self.balance = self.balance.saturating_sub(amount);
        }
        self.emitted.push(tx);
    }

    fn pay(&mut self, amount: u64, state: &MachineState) {
        let amount = amount.min(self.balance);
        if amount == 0 {
            return;
        }
        let recipient = self.account_from_b(state);
        self.emit(TransactionKind::At {
            recipient,
            amount: Some(amount),
            payload: Vec::new(),
        });
    }
}

impl PlatformApi for BlockApi<'_> {
    fn current_block_height(&self) -> u32 {
        self.block.height
    }

    fn at_creation_block_height(&self) -> u32 {
        self.at.creation_height
    }

    fn put_previous_block_hash_into_a(&mut self, state: &mut MachineState) {
        state.zero_a();
        state.set_a1(u64::from(self.block.height.saturating_sub(1)));
        state.set_a_fingerprint(&sha192(&self.block.previous_block_signature));
    }

    fn put_transaction_after_timestamp_into_a(
        &mut self,
        timestamp: AtTimestamp,
        state: &mut MachineState,
    ) {
        state.zero_a();
        let mut height = timestamp.height();
        let mut first_index = timestamp.sequence() as usize;
        while height <= self.block.height {
            let transactions = match self.repo.transactions_in_block(height) {
                Ok(transactions) => transactions,
                Err(error) => {
                    self.host_fail(state, error);
                    return;
                }
            };
            for (index, tx) in transactions.iter().enumerate().skip(first_index) {
                if tx.kind.recipient() == &self.at.address {
                    state.set_a1(AtTimestamp::new(height, index as u32 + 1).packed());
                    state.set_a_fingerprint(&sha192(&tx.signature));
                    return;
                }
            }
            height += 1;
            first_index = 0;
        }
    }

    fn type_of_transaction_in_a(&mut self, state: &mut MachineState) -> u64 {
        let Some(tx) = self.transaction_in_a(state) else {
            return 0;
        };
        // AT transactions double as payments or messages depending on
        // whether they carry an amount.
        match (tx.kind.type_code(), tx.kind.amount()) {
            (TYPE_AT, Some(_)) => u64::from(TYPE_PAYMENT),
            (TYPE_AT, None) => u64::from(TYPE_MESSAGE),
            (code @ (TYPE_PAYMENT | TYPE_MESSAGE), _) => u64::from(code),
            _ => u64::MAX,
        }
    }

    fn amount_of_transaction_in_a(&mut self, state: &mut MachineState) -> u64 {
        let Some(tx) = self.transaction_in_a(state) else {
            return 0;
        };
        match (tx.kind.type_code(), tx.kind.amount()) {
            (TYPE_PAYMENT | TYPE_MESSAGE | TYPE_AT, amount) => amount.unwrap_or(0),
            _ => u64::MAX,
        }
    }

    fn timestamp_of_transaction_in_a(&mut self, state: &mut MachineState) -> u64 {
        if self.transaction_in_a(state).is_none() {
            return 0;
        }
        state.a()[0]
    }

    fn generate_random_using_transaction_in_a(&mut self, state: &mut MachineState) -> Option<u64> {
        let tx = self.transaction_in_a(state)?;
        if state.resumed_from_sleep() {
            // The waking block's signature was unknowable when the sleep
            // was requested one block earlier, so the caller cannot
            // predict this value.
            let mut preimage = Vec::with_capacity(128);
            preimage.extend_from_slice(&tx.signature);
            preimage.extend_from_slice(&self.block.block_signature);
            let digest = sha256(&preimage);
            let mut first = [0u8; 8];
            first.copy_from_slice(&digest[..8]);
            Some(u64::from_le_bytes(first))
        } else {
            state.begin_sleep(self.block.height + 1);
            None
        }
    }

    fn put_message_from_transaction_in_a_into_b(&mut self, state: &mut MachineState) {
        let Some(tx) = self.transaction_in_a(state) else {
            return;
        };
        state.zero_b();
        if let Some(payload) = tx.kind.payload() {
            if payload.len() <= 32 {
                state.set_b_prefix(payload);
            }
        }
    }

    fn put_address_from_transaction_in_a_into_b(&mut self, state: &mut MachineState) {
        let Some(tx) = self.transaction_in_a(state) else {
            return;
        };
        state.set_b_bytes(&tx.creator_public_key);
    }

    fn put_creator_address_into_b(&mut self, state: &mut MachineState) {
        state.set_b_bytes(&self.at.creator_public_key);
    }

    fn current_balance(&self) -> u64 {
        self.balance
    }

    fn pay_amount_to_b(&mut self, amount: u64, state: &MachineState) {
        self.pay(amount, state);
    }

    fn pay_all_to_b(&mut self, state: &MachineState) {
        self.pay(self.balance, state);
    }

    fn pay_previous_to_b(&mut self, state: &MachineState) {
        self.pay(state.previous_balance(), state);
    }

    fn message_a_to_b(&mut self, state: &MachineState) {
        let recipient = self.account_from_b(state);
        self.emit(TransactionKind::At {
            recipient,
            amount: None,
            payload: state.a_bytes().to_vec(),
        });
    }

    fn add_minutes_to_timestamp(&self, timestamp: AtTimestamp, minutes: u64) -> AtTimestamp {
        timestamp.add_minutes(minutes, self.config.minutes_per_block)
    }

    fn on_finished(&mut self, amount: u64) {
        let amount = amount.min(self.balance);
        if amount == 0 {
            return;
        }
        let recipient = Address::from_public_key(&self.at.creator_public_key);
        self.emit(TransactionKind::At {
            recipient,
            amount: Some(amount),
            payload: Vec::new(),
        });
    }
}
