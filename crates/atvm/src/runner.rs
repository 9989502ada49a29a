use quarry_ledger::{Address, AtData, Repository, TransactionData};
use tracing::{debug, trace};

use crate::{
    AtError, Result,
    api::{AtContext, BlockApi, BlockContext, PlatformApi},
    state::MachineState,
};

/// Engine parameters. Consensus-relevant: every node must run with the
/// same values for a given chain.
#[derive(Debug, Clone)]
pub struct AtConfig {
    /// Hard per-round step budget; exhaustion is fatal for the round.
    pub max_steps_per_round: u32,
    /// Cost of one `ExtFun*` dispatch; every other opcode costs 1.
    pub steps_per_function_call: u32,
    pub fee_per_step: u64,
    pub minutes_per_block: u64,
    /// Creator key stamped on every AT-emitted transaction.
    pub system_public_key: [u8; 32],
}

impl Default for AtConfig {
    fn default() -> Self {
        Self {
            max_steps_per_round: 500,
            steps_per_function_call: 10,
            fee_per_step: 10_000,
            minutes_per_block: 1,
            system_public_key: [0u8; 32],
        }
    }
}

/// What one AT's round produced. The block assembler appends `emitted`
/// to the block in order and debits `fees` from the AT's account.
#[derive(Debug, Clone)]
pub struct RoundOutcome {
    pub address: Address,
    pub emitted: Vec<TransactionData>,
    pub fees: u64,
    pub steps: u32,
    pub fatal: bool,
    pub finished: bool,
    pub frozen: bool,
}

/// Run every eligible AT for the block being applied, in canonical order
/// (AT address ascending). Rounds are independent; only the emission
/// sequence numbering is threaded between them so timestamps stay
/// strictly increasing across the whole block.
pub fn run_block_ats<R: Repository>(
    repo: &mut R,
    block: &BlockContext,
    config: &AtConfig,
) -> Result<Vec<RoundOutcome>> {
    let ats = repo.ats_active_at(block.height)?;
    let mut outcomes = Vec::with_capacity(ats.len());
    let mut emitted_in_block = 0u32;

    for mut at in ats {
        if at.stopped || at.finished {
            continue;
        }
        if at.sleeping && at.sleep_until_height > block.height {
            trace!(at = %at.address, until = at.sleep_until_height, "still sleeping");
            continue;
        }

        let balance = repo.account_balance(&at.address, at.asset_id)?;
        let mut machine = MachineState::deserialize(&at.state).map_err(AtError::InvalidState)?;

        // Frozen ATs thaw only once funds arrive from outside.
        if at.frozen && balance <= machine.previous_balance() {
            continue;
        }
        machine.clear_frozen();

        let resumed = at.sleeping;
        machine.prepare_round(resumed);

        let sequence_base =
            repo.transactions_in_block(block.height)?.len() as u32 + emitted_in_block;
        let base_reference = repo
            .account_last_reference(&at.address)?
            .unwrap_or([0u8; 64]);
        let at_ctx = AtContext {
            address: at.address.clone(),
            creator_public_key: at.creator_public_key,
            creation_height: at.creation_height,
            asset_id: at.asset_id,
        };

        let (mut emitted, remaining, fees, host_error) = {
            let mut api = BlockApi::new(
                &*repo,
                block,
                &at_ctx,
                config,
                balance,
                base_reference,
                sequence_base,
            );
            machine.run(
                &mut api,
                config.max_steps_per_round,
                config.steps_per_function_call,
            );
            let fees = config
                .fee_per_step
                .saturating_mul(u64::from(machine.steps_used()));
            if (machine.is_finished() || machine.is_stopped()) && !machine.is_fatal() {
                let refund = api.balance().saturating_sub(fees);
                api.on_finished(refund);
            }
            let (emitted, remaining, host_error) = api.into_outcome();
            (emitted, remaining, fees, host_error)
        };
        if let Some(error) = host_error {
            // Ledger reads failed: the whole block application is invalid.
            return Err(error.into());
        }

        let spent = balance - remaining;
        let mut fees = fees;
        let fatal = machine.is_fatal();

        if fatal {
            // Round failed: discard emissions, debit what fees we can,
            // leave the persisted state untouched.
            emitted.clear();
            fees = fees.min(balance);
            debug!(at = %at.address, steps = machine.steps_used(), "AT round failed");
        } else if balance < fees.saturating_add(spent) {
            // Cannot cover execution fees: freeze and emit nothing.
            emitted.clear();
            fees = fees.min(balance);
            machine.set_frozen();
            machine.set_previous_balance(balance - fees);
            persist(repo, &mut at, &machine)?;
        } else {
            machine.set_previous_balance(balance - fees - spent);
            persist(repo, &mut at, &machine)?;
        }

        emitted_in_block += emitted.len() as u32;
        outcomes.push(RoundOutcome {
            address: at.address,
            emitted,
            fees,
            steps: machine.steps_used(),
            fatal,
            finished: machine.is_finished() || machine.is_stopped(),
            frozen: machine.is_frozen(),
        });
    }

    Ok(outcomes)
}

fn persist<R: Repository>(repo: &mut R, at: &mut AtData, machine: &MachineState) -> Result<()> {
    at.stopped = machine.is_stopped();
    at.finished = machine.is_finished();
    at.frozen = machine.is_frozen();
    at.sleeping = machine.is_sleeping();
    at.sleep_until_height = machine.sleep_until_height();
    at.state = machine.serialize();
    repo.save_at(at)?;
    Ok(())
}
