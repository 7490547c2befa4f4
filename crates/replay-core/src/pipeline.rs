//! Single-threaded replay with extension hooks.
//!
//! The pipeline drains a record source in order and drives the backend and
//! the extension chain through this interleaving:
//!
//! ```text
//! PreRun
//!   [BeginEpoch]
//!   PreBlock  -> begin_block
//!     PreTransaction -> begin_transaction -> process -> end_transaction -> PostTransaction
//!     ...
//!   end_block -> PostBlock
//!   [EndEpoch]
//!   ...
//! PostRun(err)
//! close
//! ```
//!
//! Any failure stops consumption. `PostRun` still runs with the error and the
//! backend is always closed, also when the processor or an extension panics;
//! the panic is resumed afterwards.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use replay_types::{TransactionRecord, TxPosition};
use state_backend::StateBackend;
use tracing::{debug, error, info, warn};

use crate::context::{ExecutionState, RunContext};
use crate::error::{classify, panic_message, ReplayError};
use crate::extension::{Extension, ExtensionChain};
use crate::processor::Processor;
use crate::source::RecordSource;

/// Block range and epoch layout of a sequential run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    pub first_block: u64,
    pub last_block: u64,
    /// Blocks per epoch. `None` disables epoch brackets.
    pub epoch_length: Option<u64>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            first_block: 0,
            last_block: u64::MAX,
            epoch_length: None,
        }
    }
}

/// Counters of a completed sequential run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineSummary {
    pub blocks: u64,
    pub transactions: u64,
    pub work_units: u64,
}

/// The sequential replay driver.
pub struct SequentialPipeline<T> {
    config: PipelineConfig,
    processor: Arc<dyn Processor<T>>,
    extensions: ExtensionChain<T>,
}

impl<T> SequentialPipeline<T> {
    pub fn new(config: PipelineConfig, processor: Arc<dyn Processor<T>>) -> Self {
        Self {
            config,
            processor,
            extensions: ExtensionChain::new(),
        }
    }

    /// Register an extension. Extensions run in registration order.
    pub fn with_extension<E: Extension<T> + 'static>(mut self, extension: E) -> Self {
        self.extensions.push(Box::new(extension));
        self
    }

    pub fn add_extension(&mut self, extension: Box<dyn Extension<T>>) {
        self.extensions.push(extension);
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Replay every record of `source` within the configured range.
    ///
    /// Returns the first error of the run. The backend is closed on every
    /// path; a close failure is only returned when nothing else failed.
    pub fn run<S>(
        &mut self,
        source: &mut S,
        backend: &mut dyn StateBackend,
    ) -> Result<PipelineSummary>
    where
        S: RecordSource<T> + ?Sized,
    {
        let first = self.config.first_block;
        let last = self.config.last_block;
        info!(first, last, extensions = self.extensions.len(), "starting sequential replay");

        let mut driver = Driver {
            config: &self.config,
            processor: self.processor.as_ref(),
            extensions: &mut self.extensions,
            ctx: RunContext::new(backend),
            open_block: None,
            open_epoch: None,
            last_position: None,
            summary: PipelineSummary::default(),
        };

        // A panic below still gets PostRun and close before it is resumed.
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| -> Result<()> {
            driver
                .extensions
                .pre_run(ExecutionState::at_block(first), &mut driver.ctx)?;
            source
                .run(first, last, &mut |record| driver.consume(record))
                .map_err(|e| {
                    if classify(&e).is_some() {
                        e
                    } else {
                        anyhow::Error::from(ReplayError::Source { source: e })
                    }
                })?;
            driver.finish()
        }));
        let (mut result, panic_payload) = match outcome {
            Ok(result) => (result, None),
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!(%message, "sequential replay panicked");
                (
                    Err(anyhow!("sequential replay panicked: {}", message)),
                    Some(payload),
                )
            }
        };

        let end_block = driver
            .open_block
            .or(driver.last_position.map(|p| p.block))
            .unwrap_or(first);
        let end_state = ExecutionState::at_block(end_block);
        let post_run = driver
            .extensions
            .post_run(end_state, &mut driver.ctx, result.as_ref().err());
        if let Err(e) = post_run {
            if result.is_ok() {
                result = Err(e);
            } else {
                warn!(error = %e, "PostRun failed after an earlier error");
            }
        }

        let summary = driver.summary;
        if let Err(close_err) = driver.ctx.backend().close() {
            if result.is_ok() {
                result = Err(ReplayError::Release {
                    block: None,
                    source: close_err,
                }
                .into());
            } else {
                warn!(error = %close_err, "closing state backend failed after an earlier error");
            }
        }

        if let Some(payload) = panic_payload {
            panic::resume_unwind(payload);
        }
        match result {
            Ok(()) => {
                info!(
                    blocks = summary.blocks,
                    transactions = summary.transactions,
                    work_units = summary.work_units,
                    "sequential replay finished"
                );
                Ok(summary)
            }
            Err(e) => Err(e),
        }
    }
}

struct Driver<'r, 'b, T> {
    config: &'r PipelineConfig,
    processor: &'r dyn Processor<T>,
    extensions: &'r mut ExtensionChain<T>,
    ctx: RunContext<'b>,
    open_block: Option<u64>,
    open_epoch: Option<u64>,
    last_position: Option<TxPosition>,
    summary: PipelineSummary,
}

impl<T> Driver<'_, '_, T> {
    fn consume(&mut self, record: TransactionRecord<T>) -> Result<()> {
        let position = record.position();
        if let Some(previous) = self.last_position {
            if position <= previous {
                return Err(ReplayError::OutOfOrder {
                    previous,
                    next: position,
                }
                .into());
            }
        }
        self.last_position = Some(position);

        if record.block < self.config.first_block || record.block > self.config.last_block {
            return Ok(());
        }

        if self.open_block != Some(record.block) {
            if let Some(block) = self.open_block {
                self.leave_block(block)?;
            }
            self.switch_epoch(record.block)?;
            self.enter_block(record.block)?;
        }

        let block = record.block;
        let transaction = record.transaction;
        let state = ExecutionState::at_transaction(&record);

        self.extensions.pre_transaction(state, &mut self.ctx)?;
        self.ctx
            .backend()
            .begin_transaction(transaction)
            .map_err(|e| ReplayError::processing(block, Some(transaction), e))?;
        self.ctx.take_work_units();
        self.processor
            .process(&record, &mut self.ctx)
            .map_err(|e| ReplayError::processing(block, Some(transaction), e))?;
        self.ctx
            .backend()
            .end_transaction()
            .map_err(|e| ReplayError::processing(block, Some(transaction), e))?;
        // Left in place for PostTransaction; reset before the next process.
        self.summary.transactions += 1;
        self.summary.work_units += self.ctx.work_units();
        self.extensions.post_transaction(state, &mut self.ctx)?;
        Ok(())
    }

    fn enter_block(&mut self, block: u64) -> Result<()> {
        self.extensions
            .pre_block(ExecutionState::at_block(block), &mut self.ctx)?;
        self.ctx
            .backend()
            .begin_block(block)
            .map_err(|e| ReplayError::processing(block, None, e))?;
        self.open_block = Some(block);
        Ok(())
    }

    fn leave_block(&mut self, block: u64) -> Result<()> {
        self.ctx
            .backend()
            .end_block()
            .map_err(|e| ReplayError::processing(block, None, e))?;
        self.open_block = None;
        self.summary.blocks += 1;
        self.extensions
            .post_block(ExecutionState::at_block(block), &mut self.ctx)?;
        Ok(())
    }

    /// Open the epoch of `block`, closing the previous one if it differs.
    fn switch_epoch(&mut self, block: u64) -> Result<()> {
        let Some(length) = self.config.epoch_length else {
            return Ok(());
        };
        let epoch = block / length.max(1);
        if self.open_epoch == Some(epoch) {
            return Ok(());
        }
        if self.open_epoch.take().is_some() {
            self.ctx
                .backend()
                .end_epoch()
                .map_err(|e| ReplayError::processing(block, None, e))?;
        }
        debug!(epoch, block, "beginning epoch");
        self.ctx
            .backend()
            .begin_epoch(epoch)
            .map_err(|e| ReplayError::processing(block, None, e))?;
        self.open_epoch = Some(epoch);
        Ok(())
    }

    /// Close whatever is still open after the last record.
    fn finish(&mut self) -> Result<()> {
        if let Some(block) = self.open_block {
            self.leave_block(block)?;
        }
        if self.open_epoch.take().is_some() {
            let block = self.last_position.map_or(self.config.first_block, |p| p.block);
            self.ctx
                .backend()
                .end_epoch()
                .map_err(|e| ReplayError::processing(block, None, e))?;
        }
        Ok(())
    }
}
