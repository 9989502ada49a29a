//! Engine-level tests: block rounds driven through the runner and the
//! block-scoped platform API against an in-memory ledger.

use quarry_atvm::{
    AtConfig, AtContext, BlockApi, BlockContext, MachineState, PlatformApi, run_block_ats,
};
use quarry_codec::hash::sha256;
use quarry_ledger::{
    Address, AtData, AtTimestamp, NO_GROUP, Repository, TransactionData, TransactionKind,
    memory::MemoryRepository,
};

const SET_VAL: u8 = 0x01;
const STP_IMD: u8 = 0x29;
const JMP_ADR: u8 = 0x1a;
const EXT_FUN_DAT: u8 = 0x33;
const EXT_FUN_DAT_2: u8 = 0x34;

const FN_SET_B1_B2: u16 = 0x011a;
const FN_SET_B3_B4: u16 = 0x011b;
const FN_SEND_TO_B: u16 = 0x0402;

/// Tiny assembler for test programs.
#[derive(Default)]
struct Asm(Vec<u8>);

impl Asm {
    fn new() -> Self {
        Self::default()
    }

    fn op(mut self, byte: u8) -> Self {
        self.0.push(byte);
        self
    }

    fn set_val(mut self, addr: u32, value: u64) -> Self {
        self.0.push(SET_VAL);
        self.0.extend_from_slice(&addr.to_le_bytes());
        self.0.extend_from_slice(&value.to_le_bytes());
        self
    }

    fn jmp(mut self, target: u32) -> Self {
        self.0.push(JMP_ADR);
        self.0.extend_from_slice(&target.to_le_bytes());
        self
    }

    fn ext_fun_dat(mut self, code: u16, addr: u32) -> Self {
        self.0.push(EXT_FUN_DAT);
        self.0.extend_from_slice(&code.to_le_bytes());
        self.0.extend_from_slice(&addr.to_le_bytes());
        self
    }

    fn ext_fun_dat2(mut self, code: u16, addr1: u32, addr2: u32) -> Self {
        self.0.push(EXT_FUN_DAT_2);
        self.0.extend_from_slice(&code.to_le_bytes());
        self.0.extend_from_slice(&addr1.to_le_bytes());
        self.0.extend_from_slice(&addr2.to_le_bytes());
        self
    }

    fn build(self) -> Vec<u8> {
        self.0
    }
}

fn signed(mut tx: TransactionData) -> TransactionData {
    tx.apply_at_signature();
    tx
}

fn payment_to(recipient: Address, amount: u64, position: AtTimestamp) -> TransactionData {
    signed(TransactionData {
        kind: TransactionKind::Payment { recipient, amount },
        timestamp: position,
        group_id: NO_GROUP,
        reference: [0u8; 64],
        creator_public_key: [0x42u8; 32],
        fee: 1,
        signature: [0u8; 64],
    })
}

fn message_to(recipient: Address, payload: Vec<u8>, position: AtTimestamp) -> TransactionData {
    signed(TransactionData {
        kind: TransactionKind::Message { recipient, payload },
        timestamp: position,
        group_id: NO_GROUP,
        reference: [0u8; 64],
        creator_public_key: [0x42u8; 32],
        fee: 1,
        signature: [0u8; 64],
    })
}

/// Loads the four B lanes with `public_key`, then pays `amount` to it.
fn pay_to_key_program(public_key: &[u8; 32], amount: u64) -> Vec<u8> {
    let lanes: Vec<u64> = public_key
        .chunks_exact(8)
        .map(|chunk| u64::from_le_bytes(chunk.try_into().unwrap()))
        .collect();
    Asm::new()
        .set_val(0, lanes[0])
        .set_val(1, lanes[1])
        .set_val(2, lanes[2])
        .set_val(3, lanes[3])
        .ext_fun_dat2(FN_SET_B1_B2, 0, 1)
        .ext_fun_dat2(FN_SET_B3_B4, 2, 3)
        .set_val(4, amount)
        .ext_fun_dat(FN_SEND_TO_B, 4)
        .op(STP_IMD)
        .build()
}

fn deploy(repo: &mut MemoryRepository, code: Vec<u8>, data_words: usize, balance: u64) -> AtData {
    let machine = MachineState::new(code, vec![0u8; data_words * 8]).unwrap();
    let at = AtData::new([0x21u8; 32], &[0x33u8; 64], 1, 0, machine.serialize());
    repo.insert_at(at.clone());
    repo.set_balance(&at.address, 0, balance);
    at
}

fn chain_of_empty_blocks(repo: &mut MemoryRepository, count: u32) {
    for height in 1..=count {
        let mut signature = [0u8; 64];
        signature[0] = height as u8;
        repo.push_block(signature, Vec::new());
    }
}

#[test]
fn scan_finds_incoming_message_and_copies_payload() {
    let mut repo = MemoryRepository::new();
    chain_of_empty_blocks(&mut repo, 9);

    let at_address = Address::for_at(&[0x21u8; 32], &[0x33u8; 64]);
    let other = Address::from_public_key(&[0x55u8; 32]);
    let payload: Vec<u8> = (1..=16).collect();
    repo.push_block(
        [10u8; 64],
        vec![
            payment_to(other.clone(), 5, AtTimestamp::new(10, 1)),
            payment_to(other, 6, AtTimestamp::new(10, 2)),
            message_to(at_address.clone(), payload.clone(), AtTimestamp::new(10, 3)),
        ],
    );

    let block = BlockContext {
        height: 10,
        block_signature: [10u8; 64],
        previous_block_signature: [9u8; 64],
    };
    let at_ctx = AtContext {
        address: at_address,
        creator_public_key: [0x21u8; 32],
        creation_height: 1,
        asset_id: 0,
    };
    let config = AtConfig::default();
    let mut api = BlockApi::new(&repo, &block, &at_ctx, &config, 0, [0u8; 64], 3);
    let mut state = MachineState::new(vec![STP_IMD], vec![0u8; 8]).unwrap();

    api.put_transaction_after_timestamp_into_a(AtTimestamp::new(9, 0), &mut state);
    assert_eq!(state.a()[0], AtTimestamp::new(10, 3).packed());

    api.put_message_from_transaction_in_a_into_b(&mut state);
    let mut expected = [0u8; 32];
    expected[..16].copy_from_slice(&payload);
    assert_eq!(state.b_bytes(), expected);

    // MESSAGE kind
    assert_eq!(api.type_of_transaction_in_a(&mut state), 17);
    assert!(!state.is_fatal());
}

#[test]
fn scan_at_tip_with_no_matches_zeroes_a() {
    let mut repo = MemoryRepository::new();
    chain_of_empty_blocks(&mut repo, 10);

    let block = BlockContext {
        height: 10,
        block_signature: [10u8; 64],
        previous_block_signature: [9u8; 64],
    };
    let at_ctx = AtContext {
        address: Address::for_at(&[0x21u8; 32], &[0x33u8; 64]),
        creator_public_key: [0x21u8; 32],
        creation_height: 1,
        asset_id: 0,
    };
    let config = AtConfig::default();
    let mut api = BlockApi::new(&repo, &block, &at_ctx, &config, 0, [0u8; 64], 0);
    let mut state = MachineState::new(vec![STP_IMD], vec![0u8; 8]).unwrap();

    state.set_a1(0xffff);
    api.put_transaction_after_timestamp_into_a(AtTimestamp::new(10, 0), &mut state);
    assert_eq!(state.a(), &[0u64; 4]);
}

#[test]
fn oversized_message_leaves_b_zero() {
    let mut repo = MemoryRepository::new();
    let at_address = Address::for_at(&[0x21u8; 32], &[0x33u8; 64]);
    repo.push_block(
        [1u8; 64],
        vec![message_to(
            at_address.clone(),
            vec![0xabu8; 33],
            AtTimestamp::new(1, 1),
        )],
    );

    let block = BlockContext {
        height: 1,
        block_signature: [1u8; 64],
        previous_block_signature: [0u8; 64],
    };
    let at_ctx = AtContext {
        address: at_address,
        creator_public_key: [0x21u8; 32],
        creation_height: 0,
        asset_id: 0,
    };
    let config = AtConfig::default();
    let mut api = BlockApi::new(&repo, &block, &at_ctx, &config, 0, [0u8; 64], 1);
    let mut state = MachineState::new(vec![STP_IMD], vec![0u8; 8]).unwrap();

    api.put_transaction_after_timestamp_into_a(AtTimestamp::new(0, 0), &mut state);
    assert_ne!(state.a()[0], 0);
    api.put_message_from_transaction_in_a_into_b(&mut state);
    assert_eq!(state.b_bytes(), [0u8; 32]);
    assert!(!state.is_fatal());
}

#[test]
fn tampered_fingerprint_is_fatal() {
    let mut repo = MemoryRepository::new();
    let at_address = Address::for_at(&[0x21u8; 32], &[0x33u8; 64]);
    repo.push_block(
        [1u8; 64],
        vec![message_to(
            at_address.clone(),
            vec![1, 2, 3],
            AtTimestamp::new(1, 1),
        )],
    );

    let block = BlockContext {
        height: 1,
        block_signature: [1u8; 64],
        previous_block_signature: [0u8; 64],
    };
    let at_ctx = AtContext {
        address: at_address,
        creator_public_key: [0x21u8; 32],
        creation_height: 0,
        asset_id: 0,
    };
    let config = AtConfig::default();
    let mut api = BlockApi::new(&repo, &block, &at_ctx, &config, 0, [0u8; 64], 1);
    let mut state = MachineState::new(vec![STP_IMD], vec![0u8; 8]).unwrap();

    api.put_transaction_after_timestamp_into_a(AtTimestamp::new(0, 0), &mut state);
    // flip one bit of the fingerprint in A2
    let a1 = state.a()[0];
    let fingerprint = state.a()[1] ^ 1;
    state.zero_a();
    state.set_a1(a1);
    let mut bytes = [0u8; 24];
    bytes[..8].copy_from_slice(&fingerprint.to_le_bytes());
    state.set_a_fingerprint(&bytes);

    assert_eq!(api.type_of_transaction_in_a(&mut state), 0);
    assert!(state.is_fatal());
}

#[test]
fn payment_emission_round() {
    let mut repo = MemoryRepository::new();
    chain_of_empty_blocks(&mut repo, 2);

    let recipient_key = [0xb0u8; 32];
    // 5 SET_VALs + 3 external calls at 10 steps + STP = 36 steps; with
    // fee_per_step = 1 and balance = 40, the final refund is exactly zero.
    let code = pay_to_key_program(&recipient_key, 4);
    let at = deploy(&mut repo, code, 5, 40);
    repo.set_last_reference(&at.address, [7u8; 64]);

    let block = BlockContext {
        height: 2,
        block_signature: [2u8; 64],
        previous_block_signature: [1u8; 64],
    };
    let config = AtConfig {
        fee_per_step: 1,
        ..AtConfig::default()
    };

    let outcomes = run_block_ats(&mut repo, &block, &config).unwrap();
    assert_eq!(outcomes.len(), 1);
    let outcome = &outcomes[0];
    assert!(!outcome.fatal);
    assert!(outcome.finished);
    assert_eq!(outcome.steps, 36);
    assert_eq!(outcome.fees, 36);
    assert_eq!(outcome.emitted.len(), 1);

    let tx = &outcome.emitted[0];
    assert_eq!(
        tx.kind,
        TransactionKind::At {
            recipient: Address::from_public_key(&recipient_key),
            amount: Some(4),
            payload: Vec::new(),
        }
    );
    // reference chains from the AT account's pre-round last reference
    assert_eq!(tx.reference, [7u8; 64]);
    assert_eq!(tx.timestamp, AtTimestamp::new(2, 1));

    // the AT terminated; its persisted state says so
    let saved = repo.at_by_address(&at.address).unwrap().unwrap();
    assert!(saved.stopped);
}

#[test]
fn step_overrun_is_fatal_and_debits_full_fees() {
    let mut repo = MemoryRepository::new();
    chain_of_empty_blocks(&mut repo, 2);

    let code = Asm::new().jmp(0).build();
    let at = deploy(&mut repo, code, 1, 150);
    let original_state = at.state.clone();

    let block = BlockContext {
        height: 2,
        block_signature: [2u8; 64],
        previous_block_signature: [1u8; 64],
    };
    let config = AtConfig {
        max_steps_per_round: 100,
        fee_per_step: 1,
        ..AtConfig::default()
    };

    let outcomes = run_block_ats(&mut repo, &block, &config).unwrap();
    assert_eq!(outcomes.len(), 1);
    let outcome = &outcomes[0];
    assert!(outcome.fatal);
    assert!(outcome.emitted.is_empty());
    assert_eq!(outcome.steps, 100);
    assert_eq!(outcome.fees, 100);

    // failed rounds leave the persisted state untouched
    let saved = repo.at_by_address(&at.address).unwrap().unwrap();
    assert_eq!(saved.state, original_state);
}

#[test]
fn emissions_chain_references_and_timestamps() {
    let mut repo = MemoryRepository::new();
    chain_of_empty_blocks(&mut repo, 2);

    let recipient_key = [0xc1u8; 32];
    let lanes: Vec<u64> = recipient_key
        .chunks_exact(8)
        .map(|chunk| u64::from_le_bytes(chunk.try_into().unwrap()))
        .collect();
    let code = Asm::new()
        .set_val(0, lanes[0])
        .set_val(1, lanes[1])
        .set_val(2, lanes[2])
        .set_val(3, lanes[3])
        .ext_fun_dat2(FN_SET_B1_B2, 0, 1)
        .ext_fun_dat2(FN_SET_B3_B4, 2, 3)
        .set_val(4, 3)
        .ext_fun_dat(FN_SEND_TO_B, 4)
        .ext_fun_dat(FN_SEND_TO_B, 4)
        .op(STP_IMD)
        .build();
    let at = deploy(&mut repo, code, 5, 1_000);
    repo.set_last_reference(&at.address, [9u8; 64]);

    let block = BlockContext {
        height: 2,
        block_signature: [2u8; 64],
        previous_block_signature: [1u8; 64],
    };
    let config = AtConfig {
        fee_per_step: 0,
        ..AtConfig::default()
    };

    let outcomes = run_block_ats(&mut repo, &block, &config).unwrap();
    let emitted = &outcomes[0].emitted;
    // two payments plus the terminal refund to the creator
    assert_eq!(emitted.len(), 3);
    assert_eq!(emitted[0].reference, [9u8; 64]);
    for window in emitted.windows(2) {
        assert!(window[1].timestamp > window[0].timestamp);
        assert_eq!(window[1].reference, window[0].signature);
    }
    assert_eq!(
        emitted[2].kind.recipient(),
        &Address::from_public_key(&[0x21u8; 32])
    );
    // refund returns everything that was not paid out
    assert_eq!(emitted[2].kind.amount(), Some(1_000 - 6));
}

#[test]
fn two_phase_randomness() {
    let mut repo = MemoryRepository::new();
    repo.push_block([0xa1u8; 64], Vec::new());

    let at_address = Address::for_at(&[0x21u8; 32], &[0x33u8; 64]);
    let incoming = payment_to(at_address.clone(), 1, AtTimestamp::new(2, 1));
    let incoming_signature = incoming.signature;
    repo.push_block([0xa2u8; 64], vec![incoming]);

    let at_ctx = AtContext {
        address: at_address,
        creator_public_key: [0x21u8; 32],
        creation_height: 0,
        asset_id: 0,
    };
    let config = AtConfig::default();
    let mut state = MachineState::new(vec![STP_IMD], vec![0u8; 8]).unwrap();
    state.prepare_round(false);

    // phase one: the machine is put to sleep and the call yields nothing
    let block = BlockContext {
        height: 2,
        block_signature: [0xa2u8; 64],
        previous_block_signature: [0xa1u8; 64],
    };
    let mut api = BlockApi::new(&repo, &block, &at_ctx, &config, 0, [0u8; 64], 1);
    api.put_transaction_after_timestamp_into_a(AtTimestamp::new(1, 0), &mut state);
    assert_eq!(
        api.generate_random_using_transaction_in_a(&mut state),
        None
    );
    assert!(state.is_sleeping());
    assert_eq!(state.sleep_until_height(), 3);

    // state survives the round boundary through the blob
    let mut woken = MachineState::deserialize(&state.serialize()).unwrap();
    woken.prepare_round(true);

    repo.push_block([0xa3u8; 64], Vec::new());
    let block = BlockContext {
        height: 3,
        block_signature: [0xa3u8; 64],
        previous_block_signature: [0xa2u8; 64],
    };
    let mut api = BlockApi::new(&repo, &block, &at_ctx, &config, 0, [0u8; 64], 0);
    let value = api
        .generate_random_using_transaction_in_a(&mut woken)
        .unwrap();

    // derived from the waking block's signature, which did not exist
    // when the sleep was requested
    let mut preimage = Vec::new();
    preimage.extend_from_slice(&incoming_signature);
    preimage.extend_from_slice(&[0xa3u8; 64]);
    let expected = u64::from_le_bytes(sha256(&preimage)[..8].try_into().unwrap());
    assert_eq!(value, expected);
    assert!(!woken.is_sleeping());
}

/// A `'Q'`-prefixed byte string that is not a valid address falls back
/// to the public-key route, as does anything without the prefix. (A full
/// valid address never fits the 32-byte register, so the address branch
/// of the rule stays cold.)
#[rstest::rstest]
#[case::q_prefixed_invalid({
    let mut key = [0x11u8; 32];
    key[0] = b'Q';
    key
})]
#[case::no_leading_q([0x77u8; 32])]
fn account_from_b_routes_through_public_key(#[case] key: [u8; 32]) {
    let mut repo = MemoryRepository::new();
    chain_of_empty_blocks(&mut repo, 2);

    let code = pay_to_key_program(&key, 2);
    deploy(&mut repo, code, 5, 1_000);
    let block = BlockContext {
        height: 2,
        block_signature: [2u8; 64],
        previous_block_signature: [1u8; 64],
    };
    let config = AtConfig {
        fee_per_step: 0,
        ..AtConfig::default()
    };
    let outcomes = run_block_ats(&mut repo, &block, &config).unwrap();
    assert_eq!(
        outcomes[0].emitted[0].kind.recipient(),
        &Address::from_public_key(&key),
        "key {key:02x?} must resolve through the public-key route"
    );
}

#[test]
fn stored_blob_round_trips_after_round() {
    let mut repo = MemoryRepository::new();
    chain_of_empty_blocks(&mut repo, 2);
    let at = deploy(&mut repo, pay_to_key_program(&[0xb0u8; 32], 4), 5, 1_000);

    let block = BlockContext {
        height: 2,
        block_signature: [2u8; 64],
        previous_block_signature: [1u8; 64],
    };
    run_block_ats(&mut repo, &block, &AtConfig::default()).unwrap();

    let saved = repo.at_by_address(&at.address).unwrap().unwrap();
    let machine = MachineState::deserialize(&saved.state).unwrap();
    assert_eq!(machine.serialize(), saved.state);
}

#[test]
fn sleeping_at_is_skipped_until_due() {
    let mut repo = MemoryRepository::new();
    chain_of_empty_blocks(&mut repo, 3);

    // SLP_IMD then STP: first round sleeps, the round after wake stops
    let code = Asm::new().op(0x2a).op(STP_IMD).build();
    let at = deploy(&mut repo, code, 1, 1_000);

    let config = AtConfig {
        fee_per_step: 0,
        ..AtConfig::default()
    };
    let block2 = BlockContext {
        height: 2,
        block_signature: [2u8; 64],
        previous_block_signature: [1u8; 64],
    };
    let outcomes = run_block_ats(&mut repo, &block2, &config).unwrap();
    assert_eq!(outcomes.len(), 1);
    assert!(!outcomes[0].finished);
    let saved = repo.at_by_address(&at.address).unwrap().unwrap();
    assert!(saved.sleeping);
    assert_eq!(saved.sleep_until_height, 3);

    let block3 = BlockContext {
        height: 3,
        block_signature: [3u8; 64],
        previous_block_signature: [2u8; 64],
    };
    let outcomes = run_block_ats(&mut repo, &block3, &config).unwrap();
    assert_eq!(outcomes.len(), 1);
    assert!(outcomes[0].finished);
}
