//! Deterministic synthetic transfer histories for benchmarks and tests.

use anyhow::{bail, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use replay_core::{Processor, RunContext, VecSource};
use replay_types::{Account, Address, TransactionRecord, UpdateSet, WorldState};
use serde::{Deserialize, Serialize};

/// Gas charged per transfer.
pub const TRANSFER_GAS: u64 = 21_000;

/// Moves `amount` from `from` to `to`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transfer {
    pub from: Address,
    pub to: Address,
    pub amount: u128,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryParams {
    /// First block carrying transactions. The genesis state is block
    /// `first_block - 1`.
    pub first_block: u64,
    pub last_block: u64,
    pub accounts: u64,
    pub transactions_per_block: u32,
    pub initial_balance: u128,
    pub max_amount: u128,
    pub seed: u64,
}

impl Default for HistoryParams {
    fn default() -> Self {
        Self {
            first_block: 1,
            last_block: 1_000,
            accounts: 1_000,
            transactions_per_block: 10,
            initial_balance: 1_000_000_000,
            max_amount: 100,
            seed: 42,
        }
    }
}

/// Genesis update set plus the transfers of every block.
#[derive(Debug, Clone)]
pub struct SyntheticHistory {
    pub genesis: UpdateSet,
    pub records: Vec<TransactionRecord<Transfer>>,
}

impl SyntheticHistory {
    /// Same parameters, same history.
    pub fn generate(params: &HistoryParams) -> Result<Self> {
        if params.first_block == 0 {
            bail!("synthetic history needs a genesis block before the first block");
        }
        if params.accounts < 2 {
            bail!("synthetic history needs at least two accounts");
        }
        if params.first_block > params.last_block {
            bail!(
                "first block {} is after last block {}",
                params.first_block,
                params.last_block
            );
        }

        let accounts: WorldState = (0..params.accounts)
            .map(|i| (account(i), Account::with_balance(params.initial_balance)))
            .collect();
        let genesis = UpdateSet::new(params.first_block - 1, accounts);

        let mut rng = StdRng::seed_from_u64(params.seed);
        let mut records = Vec::new();
        for block in params.first_block..=params.last_block {
            for tx in 0..params.transactions_per_block {
                let from = rng.gen_range(0..params.accounts);
                let mut to = rng.gen_range(0..params.accounts - 1);
                if to >= from {
                    to += 1;
                }
                let amount = rng.gen_range(1..=params.max_amount.max(1));
                records.push(TransactionRecord::new(
                    block,
                    tx,
                    Transfer {
                        from: account(from),
                        to: account(to),
                        amount,
                    },
                ));
            }
        }
        Ok(Self { genesis, records })
    }

    pub fn source(&self) -> VecSource<Transfer> {
        VecSource::new(self.records.clone())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Address of synthetic account `index`; index 0 maps to `0x..01`.
pub fn account(index: u64) -> Address {
    Address::from_low_u64(index + 1)
}

/// Applies transfers, bumping the sender's nonce.
///
/// Transfers the sender cannot cover are reported through
/// [`RunContext::report_error`], so they only stop the run when no error
/// sink is installed.
#[derive(Debug, Clone, Default)]
pub struct TransferProcessor {
    fail_at: Option<u64>,
}

impl TransferProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every transaction of `block` unconditionally.
    pub fn failing_at(block: Option<u64>) -> Self {
        Self { fail_at: block }
    }
}

impl Processor<Transfer> for TransferProcessor {
    fn process(&self, record: &TransactionRecord<Transfer>, ctx: &mut RunContext<'_>) -> Result<()> {
        if self.fail_at == Some(record.block) {
            bail!("injected failure in block {}", record.block);
        }
        let Transfer { from, to, amount } = record.payload;

        let balance = ctx.backend_ref().get_balance(&from)?;
        if balance < amount {
            return ctx.report_error(anyhow::anyhow!(
                "transaction {}: {} holds {} but sends {}",
                record.position(),
                from,
                balance,
                amount
            ));
        }
        let nonce = ctx.backend_ref().get_nonce(&from)?;
        let received = ctx.backend_ref().get_balance(&to)?;

        let backend = ctx.backend();
        backend.set_balance(&from, balance - amount)?;
        backend.set_balance(&to, received + amount)?;
        backend.set_nonce(&from, nonce + 1)?;
        ctx.record_work(TRANSFER_GAS);
        Ok(())
    }
}
