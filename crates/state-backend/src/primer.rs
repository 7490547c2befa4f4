//! Priming: bulk-loading a backend with the state as of a target block.
//!
//! Update sets are merged in block order into a pending [`WorldState`]. When
//! the next merge would push the estimated pending size past the configured
//! buffer, the pending set is flushed into the backend through a bulk load and
//! a fresh set is started. Accounts destroyed by an update set have their
//! pending storage cleared and, once anything has been flushed, are deleted
//! from the backend too.

use anyhow::{Context, Result};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use replay_types::{Account, Address, UpdateSet, WorldState};
use tracing::{debug, info};

use crate::backend::{BulkLoad, StateBackend};

/// Priming parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrimeConfig {
    /// Maximum estimated size in bytes of the pending update set.
    pub buffer_bytes: u64,
    /// Load accounts in shuffled rather than address order.
    pub random: bool,
    /// Seed for the shuffle.
    pub seed: u64,
}

impl Default for PrimeConfig {
    fn default() -> Self {
        Self {
            buffer_bytes: u64::MAX,
            random: false,
            seed: 0,
        }
    }
}

/// Summary of a priming run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PrimeStats {
    /// Update sets merged.
    pub update_sets: u64,
    /// Bulk loads issued.
    pub flushes: u64,
    /// Accounts written (counting an account once per flush).
    pub accounts_primed: u64,
    /// Delete calls issued against the backend.
    pub accounts_deleted: u64,
    /// Block of the last merged update set.
    pub last_block: Option<u64>,
}

/// Drives update sets into a backend.
#[derive(Debug, Clone, Default)]
pub struct Primer {
    config: PrimeConfig,
}

impl Primer {
    pub fn new(config: PrimeConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PrimeConfig {
        &self.config
    }

    /// Prime `backend` with every update set up to and including `target`.
    ///
    /// Update sets must arrive in ascending block order; iteration stops at
    /// the first set beyond `target`.
    pub fn prime<I>(
        &self,
        backend: &mut dyn StateBackend,
        updates: I,
        target: u64,
    ) -> Result<PrimeStats>
    where
        I: IntoIterator<Item = UpdateSet>,
    {
        info!(
            target_block = target,
            buffer_bytes = self.config.buffer_bytes,
            random = self.config.random,
            "priming state backend"
        );

        let mut stats = PrimeStats::default();
        let mut pending = WorldState::new();
        let mut pending_size = 0u64;
        let mut has_primed = false;

        for update in updates {
            if update.block > target {
                break;
            }

            let incremental = pending.estimate_incremental_size(&update.accounts);
            let over_budget = pending_size.saturating_add(incremental) > self.config.buffer_bytes;
            if over_budget && !pending.is_empty() {
                self.flush(backend, &pending, target, &mut stats).with_context(|| {
                    format!("cannot prime state backend at block {}", update.block)
                })?;
                pending = WorldState::new();
                pending_size = 0;
                has_primed = true;
            }

            clear_storage(&mut pending, &update.deleted);
            if has_primed && !update.deleted.is_empty() {
                self.delete_accounts(backend, &update.deleted, target, &mut stats)
                    .with_context(|| {
                        format!("cannot delete destroyed accounts of block {}", update.block)
                    })?;
            }

            pending.merge(&update.accounts);
            pending_size = pending_size.saturating_add(incremental);
            stats.update_sets += 1;
            stats.last_block = Some(update.block);
            debug!(
                block = update.block,
                total_mb = pending_size / 1_000_000,
                added_mb = incremental / 1_000_000,
                "merged update set"
            );
        }

        if !pending.is_empty() {
            self.flush(backend, &pending, target, &mut stats)
                .context("cannot prime state backend")?;
        }

        info!(
            update_sets = stats.update_sets,
            flushes = stats.flushes,
            accounts = stats.accounts_primed,
            deleted = stats.accounts_deleted,
            "priming finished"
        );
        Ok(stats)
    }

    /// Load one world state through a single bulk load.
    pub fn prime_world_state(
        &self,
        backend: &mut dyn StateBackend,
        state: &WorldState,
        block: u64,
    ) -> Result<u64> {
        let mut load = backend.start_bulk_load(block)?;
        let mut addresses: Vec<&Address> = state.addresses().collect();
        if self.config.random {
            // Sorted first, so the shuffle depends only on the seed.
            addresses.sort();
            let mut rng = StdRng::seed_from_u64(self.config.seed);
            addresses.shuffle(&mut rng);
        }

        let mut loaded = 0u64;
        for address in addresses {
            if let Some(account) = state.get(address) {
                load_account(load.as_mut(), address, account)?;
                loaded += 1;
            }
        }
        load.close()?;
        Ok(loaded)
    }

    fn flush(
        &self,
        backend: &mut dyn StateBackend,
        pending: &WorldState,
        block: u64,
        stats: &mut PrimeStats,
    ) -> Result<()> {
        debug!(accounts = pending.len(), block, "flushing update set into backend");
        stats.accounts_primed += self.prime_world_state(backend, pending, block)?;
        stats.flushes += 1;
        Ok(())
    }

    fn delete_accounts(
        &self,
        backend: &mut dyn StateBackend,
        accounts: &[Address],
        block: u64,
        stats: &mut PrimeStats,
    ) -> Result<()> {
        backend.begin_block(block)?;
        backend.begin_transaction(0)?;
        for address in accounts {
            backend.delete_account(address)?;
            stats.accounts_deleted += 1;
        }
        backend.end_transaction()?;
        backend.end_block()?;
        Ok(())
    }
}

fn load_account(load: &mut dyn BulkLoad, address: &Address, account: &Account) -> Result<()> {
    load.create_account(address)?;
    load.set_balance(address, account.balance)?;
    load.set_nonce(address, account.nonce)?;
    load.set_code(address, &account.code)?;
    for (key, value) in &account.storage {
        load.set_state(address, key, value)?;
    }
    Ok(())
}

/// Forget storage of destroyed accounts that is still pending.
fn clear_storage(pending: &mut WorldState, deleted: &[Address]) {
    for address in deleted {
        if let Some(account) = pending.get_mut(address) {
            account.storage.clear();
        }
    }
}
