//! Priming as a pipeline extension.

use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use replay_types::UpdateSet;
use state_backend::{PrimeConfig, PrimeStats, Primer};
use tracing::info;

use crate::context::{ExecutionState, RunContext};
use crate::extension::Extension;

/// Loads the state as of `first_block - 1` before the first block is opened.
///
/// Does nothing when the run starts at block 0 or priming is switched off.
pub struct StatePrimer {
    primer: Primer,
    updates: Vec<UpdateSet>,
    skip: bool,
    stats: Arc<Mutex<Option<PrimeStats>>>,
}

impl StatePrimer {
    /// `updates` must be in ascending block order.
    pub fn new(config: PrimeConfig, updates: Vec<UpdateSet>) -> Self {
        Self {
            primer: Primer::new(config),
            updates,
            skip: false,
            stats: Arc::new(Mutex::new(None)),
        }
    }

    pub fn skip(mut self, skip: bool) -> Self {
        self.skip = skip;
        self
    }

    /// Statistics of the priming run, once it happened.
    pub fn stats(&self) -> Arc<Mutex<Option<PrimeStats>>> {
        Arc::clone(&self.stats)
    }
}

impl<T> Extension<T> for StatePrimer {
    fn pre_run(&mut self, state: ExecutionState<'_, T>, ctx: &mut RunContext<'_>) -> Result<()> {
        if self.skip || state.block == 0 {
            info!(first_block = state.block, skip = self.skip, "priming skipped");
            return Ok(());
        }
        let target = state.block - 1;
        let updates = std::mem::take(&mut self.updates);
        let stats = self
            .primer
            .prime(ctx.backend(), updates, target)
            .with_context(|| format!("cannot prime state up to block {}", target))?;
        *self.stats.lock() = Some(stats);
        Ok(())
    }

    fn name(&self) -> String {
        "StatePrimer".to_string()
    }
}
