//! Progress reports for the sequential pipeline.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use parking_lot::Mutex;

use crate::context::{ExecutionState, RunContext};
use crate::extension::Extension;
use crate::progress::{directory_size, ProgressAggregator, ProgressReport, ReportPolicy};

/// Shared record of every report a tracker emitted.
pub type ProgressHistory = Arc<Mutex<Vec<ProgressReport>>>;

/// Counts transactions and work units and logs a report whenever the policy
/// allows one after a block completes.
pub struct ProgressTracker {
    policy: ReportPolicy,
    state_dir: Option<PathBuf>,
    aggregator: Option<ProgressAggregator>,
    history: ProgressHistory,
}

impl ProgressTracker {
    pub fn new(policy: ReportPolicy) -> Self {
        Self {
            policy,
            state_dir: None,
            aggregator: None,
            history: ProgressHistory::default(),
        }
    }

    /// Report the size of `dir` as disk usage.
    pub fn with_state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.state_dir = Some(dir.into());
        self
    }

    /// Handle to the emitted reports, valid after the tracker is moved into a
    /// pipeline.
    pub fn history(&self) -> ProgressHistory {
        Arc::clone(&self.history)
    }
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new(ReportPolicy::sequential())
    }
}

impl<T> Extension<T> for ProgressTracker {
    fn pre_run(&mut self, state: ExecutionState<'_, T>, _ctx: &mut RunContext<'_>) -> Result<()> {
        self.aggregator = Some(ProgressAggregator::new(
            self.policy,
            state.block,
            Instant::now(),
        ));
        Ok(())
    }

    fn post_transaction(
        &mut self,
        _state: ExecutionState<'_, T>,
        ctx: &mut RunContext<'_>,
    ) -> Result<()> {
        if let Some(aggregator) = self.aggregator.as_mut() {
            aggregator.record_transaction(ctx.work_units());
        }
        Ok(())
    }

    fn post_block(&mut self, state: ExecutionState<'_, T>, ctx: &mut RunContext<'_>) -> Result<()> {
        let Some(aggregator) = self.aggregator.as_mut() else {
            return Ok(());
        };
        aggregator.record_block(state.block);
        let state_dir = self.state_dir.as_deref();
        let report = aggregator.poll(Instant::now(), || {
            (
                ctx.backend_ref().memory_usage().map(|m| m.used_bytes),
                state_dir.map(directory_size),
            )
        });
        if let Some(report) = report {
            report.log();
            self.history.lock().push(report);
        }
        Ok(())
    }

    fn name(&self) -> String {
        "ProgressTracker".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use state_backend::InMemoryBackend;

    #[test]
    fn test_reports_on_block_frequency() {
        let mut tracker = ProgressTracker::new(ReportPolicy {
            min_interval: Duration::ZERO,
            block_frequency: 10,
        });
        let history = tracker.history();
        let mut backend = InMemoryBackend::new();
        let mut ctx = RunContext::new(&mut backend);

        Extension::<()>::pre_run(&mut tracker, ExecutionState::at_block(1), &mut ctx).unwrap();
        for block in 1..=25 {
            ctx.record_work(3);
            Extension::<()>::post_transaction(&mut tracker, ExecutionState::at_block(block), &mut ctx)
                .unwrap();
            ctx.take_work_units();
            Extension::<()>::post_block(&mut tracker, ExecutionState::at_block(block), &mut ctx)
                .unwrap();
        }

        let reports = history.lock();
        assert_eq!(
            reports.iter().map(|r| r.block).collect::<Vec<_>>(),
            vec![10, 20]
        );
        assert_eq!(reports[0].transactions, 10);
        assert_eq!(reports[0].work_units, 30);
        assert_eq!(reports[1].transactions, 10);
        assert_eq!(reports[1].total_transactions, 20);
        assert!(reports[0].memory_bytes.is_some());
        assert_eq!(reports[0].disk_bytes, None);
    }

    #[test]
    fn test_hooks_before_pre_run_are_ignored() {
        let mut tracker = ProgressTracker::default();
        let mut backend = InMemoryBackend::new();
        let mut ctx = RunContext::new(&mut backend);
        Extension::<()>::post_block(&mut tracker, ExecutionState::at_block(100_000), &mut ctx)
            .unwrap();
        assert!(tracker.history().lock().is_empty());
    }
}
