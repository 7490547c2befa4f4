//! Parallel replay of historical blocks against archive snapshots.
//!
//! Each block is replayed on an isolated snapshot of the state as of the
//! previous block, so blocks are independent and can run on any worker in any
//! order. Within a block, record order is preserved.
//!
//! ```text
//!             batches (bounded, 10 x workers)
//! producer ---------------------------------> worker 0..N
//!    |                                           |
//!    | issues                tx / block / issues |
//!    v                                           v
//!              aggregator (calling thread)
//! ```
//!
//! The first error cancels the run. The producer stops emitting batches,
//! workers stop opening snapshots and discard whatever is still queued, and
//! the aggregator keeps draining telemetry until every thread has signalled
//! exit. Later errors are logged and counted but do not replace the first.

use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use crossbeam_channel::{bounded, select, unbounded, Receiver, Sender};
use replay_types::TransactionRecord;
use state_backend::{ArchiveBackend, StateBackend};
use tracing::{debug, error, info, warn};

use crate::batch::{Batch, Batcher};
use crate::context::RunContext;
use crate::error::{classify, panic_message, ReplayError};
use crate::processor::Processor;
use crate::progress::{directory_size, ProgressAggregator, ReportPolicy};
use crate::source::RecordSource;

/// Batches queued per worker.
const QUEUE_DEPTH_PER_WORKER: usize = 10;

/// How often the aggregator wakes up without traffic.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Parameters of an archive replay run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveConfig {
    pub first_block: u64,
    pub last_block: u64,
    pub workers: usize,
    /// `None` disables progress reports.
    pub report: Option<ReportPolicy>,
    /// Directory whose size is reported as disk usage.
    pub state_dir: Option<PathBuf>,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            first_block: 0,
            last_block: u64::MAX,
            workers: 4,
            report: Some(ReportPolicy::archive()),
            state_dir: None,
        }
    }
}

/// One-shot cooperative cancellation flag.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Counters of an archive replay.
///
/// On failure they cover the work finished before the run stopped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArchiveSummary {
    pub blocks: u64,
    pub transactions: u64,
    pub work_units: u64,
    /// Batches discarded by workers after cancellation.
    pub skipped_batches: u64,
    /// Errors received after the first one.
    pub suppressed_errors: u64,
    pub elapsed: Duration,
}

/// Counters of a finished run plus the error that ended it, if any.
#[derive(Debug)]
pub struct ArchiveOutcome {
    pub summary: ArchiveSummary,
    pub error: Option<anyhow::Error>,
}

impl ArchiveOutcome {
    pub fn into_result(self) -> Result<ArchiveSummary> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.summary),
        }
    }
}

/// The parallel archive replay engine.
pub struct ArchiveReplay<T> {
    config: ArchiveConfig,
    processor: Arc<dyn Processor<T>>,
    external_cancel: CancellationToken,
}

impl<T: Send> ArchiveReplay<T> {
    pub fn new(config: ArchiveConfig, processor: Arc<dyn Processor<T>>) -> Self {
        Self {
            config,
            processor,
            external_cancel: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &ArchiveConfig {
        &self.config
    }

    /// Token that cancels a running replay from outside.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.external_cancel.clone()
    }

    /// Replay every record of `source` within the configured range.
    ///
    /// Returns the first error encountered. Blocks completed before the error
    /// are not rolled back.
    pub fn run<S, B>(&self, source: &mut S, backend: &B) -> Result<ArchiveSummary>
    where
        S: RecordSource<T> + Send + ?Sized,
        B: ArchiveBackend + ?Sized,
    {
        self.run_outcome(source, backend).into_result()
    }

    /// Like [`ArchiveReplay::run`], but keeps the counters of a failed run.
    pub fn run_outcome<S, B>(&self, source: &mut S, backend: &B) -> ArchiveOutcome
    where
        S: RecordSource<T> + Send + ?Sized,
        B: ArchiveBackend + ?Sized,
    {
        let workers = self.config.workers;
        if workers == 0 {
            return ArchiveOutcome {
                summary: ArchiveSummary::default(),
                error: Some(anyhow!("archive replay needs at least one worker")),
            };
        }
        let first = self.config.first_block;
        let last = self.config.last_block;
        info!(first, last, workers, "starting archive replay");

        let started = Instant::now();
        let capacity = workers * QUEUE_DEPTH_PER_WORKER;
        let cancel = CancellationToken::new();

        let (batch_tx, batch_rx) = bounded::<Batch<T>>(capacity);
        let (tx_done_tx, tx_done_rx) = bounded::<u64>(capacity);
        let (block_done_tx, block_done_rx) = bounded::<u64>(capacity);
        let (issue_tx, issue_rx) = bounded::<anyhow::Error>(capacity);
        let (exit_tx, exit_rx) = unbounded::<ThreadExit>();
        // Never sent on; dropping the sender wakes a producer blocked on a full queue.
        let (abort_tx, abort_rx) = bounded::<()>(0);

        let telemetry = Telemetry {
            transactions: tx_done_tx,
            blocks: block_done_tx,
            issues: issue_tx,
        };
        let processor = self.processor.as_ref();

        let mut aggregator = Aggregator {
            progress: ProgressAggregator::new(
                self.config.report.unwrap_or_else(ReportPolicy::archive),
                first,
                started,
            ),
            first_error: None,
            suppressed: 0,
            skipped: 0,
            abort: Some(abort_tx),
            cancel: cancel.clone(),
        };

        thread::scope(|scope| {
            {
                let issues = telemetry.issues.clone();
                let exit_tx = exit_tx.clone();
                let cancel = cancel.clone();
                scope.spawn(move || {
                    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                        produce(source, first, last, &batch_tx, &abort_rx, &cancel)
                    }));
                    drop(batch_tx);
                    let failure = match outcome {
                        Ok(Ok(())) => None,
                        Ok(Err(e)) => Some(e),
                        Err(payload) => Some(anyhow!(
                            "record producer panicked: {}",
                            panic_message(payload.as_ref())
                        )),
                    };
                    if let Some(err) = failure {
                        let _ = issues.send(err);
                    }
                    let _ = exit_tx.send(ThreadExit::producer());
                });
            }

            for worker in 0..workers {
                let batches = batch_rx.clone();
                let telemetry = telemetry.clone();
                let exit_tx = exit_tx.clone();
                let cancel = cancel.clone();
                scope.spawn(move || {
                    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                        worker_loop(worker, &batches, backend, processor, &telemetry, &cancel)
                    }));
                    let exit = match outcome {
                        Ok(skipped) => ThreadExit::worker(worker, skipped, None),
                        Err(payload) => ThreadExit::worker(
                            worker,
                            0,
                            Some(panic_message(payload.as_ref())),
                        ),
                    };
                    let _ = exit_tx.send(exit);
                });
            }
            drop(batch_rx);

            let mut pending = workers + 1;
            while pending > 0 {
                select! {
                    recv(tx_done_rx) -> msg => {
                        if let Ok(work) = msg {
                            aggregator.progress.record_transaction(work);
                        }
                    }
                    recv(block_done_rx) -> msg => {
                        if let Ok(block) = msg {
                            aggregator.progress.record_block(block);
                        }
                    }
                    recv(issue_rx) -> msg => {
                        if let Ok(err) = msg {
                            aggregator.fail(err);
                        }
                    }
                    recv(exit_rx) -> msg => {
                        if let Ok(exit) = msg {
                            pending -= 1;
                            aggregator.exit(exit);
                        }
                    }
                    default(POLL_INTERVAL) => {}
                }

                if self.external_cancel.is_cancelled() && !cancel.is_cancelled() {
                    warn!("archive replay cancelled externally");
                    aggregator.cancel();
                }
                if self.config.report.is_some() {
                    let report = aggregator.progress.poll(Instant::now(), || {
                        (
                            backend.memory_usage().map(|m| m.used_bytes),
                            self.config.state_dir.as_deref().map(directory_size),
                        )
                    });
                    if let Some(report) = report {
                        report.log();
                    }
                }
            }

            // Every thread has exited; whatever they sent is already queued.
            for work in tx_done_rx.try_iter() {
                aggregator.progress.record_transaction(work);
            }
            for block in block_done_rx.try_iter() {
                aggregator.progress.record_block(block);
            }
            for err in issue_rx.try_iter() {
                aggregator.fail(err);
            }
        });

        let summary = ArchiveSummary {
            blocks: aggregator.progress.total_blocks(),
            transactions: aggregator.progress.total_transactions(),
            work_units: aggregator.progress.total_work(),
            skipped_batches: aggregator.skipped,
            suppressed_errors: aggregator.suppressed,
            elapsed: started.elapsed(),
        };

        if let Some(err) = aggregator.first_error {
            error!(
                blocks = summary.blocks,
                transactions = summary.transactions,
                skipped_batches = summary.skipped_batches,
                suppressed_errors = summary.suppressed_errors,
                "archive replay failed"
            );
            return ArchiveOutcome {
                summary,
                error: Some(err),
            };
        }
        if cancel.is_cancelled() {
            return ArchiveOutcome {
                summary,
                error: Some(anyhow!(
                    "archive replay cancelled after {} blocks ({} batches skipped)",
                    summary.blocks,
                    summary.skipped_batches
                )),
            };
        }

        info!(
            blocks = summary.blocks,
            transactions = summary.transactions,
            work_units = summary.work_units,
            elapsed_secs = summary.elapsed.as_secs_f64(),
            "archive replay finished"
        );
        ArchiveOutcome {
            summary,
            error: None,
        }
    }
}

/// Worker-to-aggregator channels.
#[derive(Clone)]
struct Telemetry {
    /// Work units of each completed transaction.
    transactions: Sender<u64>,
    /// Number of each completed block.
    blocks: Sender<u64>,
    issues: Sender<anyhow::Error>,
}

/// Final message of every producer and worker thread.
#[derive(Debug)]
struct ThreadExit {
    worker: Option<usize>,
    skipped: u64,
    panic: Option<String>,
}

impl ThreadExit {
    fn producer() -> Self {
        Self {
            worker: None,
            skipped: 0,
            panic: None,
        }
    }

    fn worker(worker: usize, skipped: u64, panic: Option<String>) -> Self {
        Self {
            worker: Some(worker),
            skipped,
            panic,
        }
    }
}

/// Aggregator-side state.
struct Aggregator {
    progress: ProgressAggregator,
    first_error: Option<anyhow::Error>,
    suppressed: u64,
    skipped: u64,
    abort: Option<Sender<()>>,
    cancel: CancellationToken,
}

impl Aggregator {
    fn cancel(&mut self) {
        self.cancel.cancel();
        self.abort.take();
    }

    fn fail(&mut self, err: anyhow::Error) {
        if self.first_error.is_none() {
            error!(error = %err, "archive replay error; cancelling remaining work");
            self.cancel();
            self.first_error = Some(err);
        } else {
            self.suppressed += 1;
            warn!(error = %err, "additional archive replay error");
        }
    }

    fn exit(&mut self, exit: ThreadExit) {
        self.skipped += exit.skipped;
        match (exit.worker, exit.panic) {
            (Some(worker), Some(message)) => {
                self.fail(ReplayError::WorkerPanic { worker, message }.into());
            }
            (Some(worker), None) => debug!(worker, skipped = exit.skipped, "worker finished"),
            (None, _) => debug!("producer finished"),
        }
    }
}

/// Marker error used by the producer to stop the source after cancellation.
#[derive(Debug)]
struct Cancelled;

impl std::fmt::Display for Cancelled {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "cancelled")
    }
}

impl std::error::Error for Cancelled {}

/// Group the source into batches and queue them.
fn produce<T, S>(
    source: &mut S,
    first: u64,
    last: u64,
    batches: &Sender<Batch<T>>,
    abort: &Receiver<()>,
    cancel: &CancellationToken,
) -> Result<()>
where
    S: RecordSource<T> + ?Sized,
{
    let mut batcher = Batcher::new();
    let mut emitted = 0u64;

    // Returns false once the run is being torn down.
    let emit = |batch: Batch<T>| -> bool {
        select! {
            send(batches, batch) -> res => res.is_ok(),
            recv(abort) -> _ => false,
        }
    };

    let result = source.run(first, last, &mut |record: TransactionRecord<T>| -> Result<()> {
        if cancel.is_cancelled() {
            return Err(Cancelled.into());
        }
        if let Some(batch) = batcher.push(record)? {
            if !emit(batch) {
                return Err(Cancelled.into());
            }
            emitted += 1;
        }
        Ok(())
    });

    match result {
        Ok(()) => {
            if let Some(batch) = batcher.finish() {
                if !cancel.is_cancelled() && emit(batch) {
                    emitted += 1;
                }
            }
            debug!(batches = emitted, "record source exhausted");
            Ok(())
        }
        Err(e) if e.is::<Cancelled>() => {
            debug!(batches = emitted, "producer stopped by cancellation");
            Ok(())
        }
        Err(e) if classify(&e).is_some() => Err(e),
        Err(e) => Err(ReplayError::Source { source: e }.into()),
    }
}

/// Take batches until the queue closes, replaying them unless cancelled.
fn worker_loop<T, B>(
    worker: usize,
    batches: &Receiver<Batch<T>>,
    backend: &B,
    processor: &dyn Processor<T>,
    telemetry: &Telemetry,
    cancel: &CancellationToken,
) -> u64
where
    B: ArchiveBackend + ?Sized,
{
    let mut skipped = 0u64;
    for batch in batches.iter() {
        // Keep draining so the producer never blocks on a full queue, but
        // open no new snapshots.
        if cancel.is_cancelled() {
            skipped += 1;
            continue;
        }
        let block = batch.block();
        if let Err(err) = replay_batch(&batch, backend, processor, telemetry) {
            debug!(worker, block, "batch failed");
            // Stop the other workers now; the coordinator still picks the reported error.
            cancel.cancel();
            let _ = telemetry.issues.send(err);
        }
    }
    skipped
}

/// Replay one block on a fresh snapshot of its pre-state.
fn replay_batch<T, B>(
    batch: &Batch<T>,
    backend: &B,
    processor: &dyn Processor<T>,
    telemetry: &Telemetry,
) -> Result<()>
where
    B: ArchiveBackend + ?Sized,
{
    let block = batch.block();
    if block == 0 {
        return Err(ReplayError::Snapshot {
            block,
            source: anyhow!("block 0 has no archived pre-state"),
        }
        .into());
    }
    let mut snapshot = backend
        .open_archive_snapshot(block - 1)
        .map_err(|source| ReplayError::Snapshot { block, source })?;

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        replay_records(batch, snapshot.as_mut(), processor, telemetry)
    }));
    let closed = snapshot.close();
    let result = match outcome {
        Ok(result) => result,
        Err(payload) => {
            if let Err(close_err) = closed {
                warn!(block, error = %close_err, "closing snapshot failed after a panic");
            }
            // The worker turns the panic into an error once the snapshot is released.
            panic::resume_unwind(payload);
        }
    };
    match (result, closed) {
        (Ok(()), Ok(())) => Ok(()),
        (Ok(()), Err(source)) => Err(ReplayError::Release {
            block: Some(block),
            source,
        }
        .into()),
        (Err(e), Ok(())) => Err(e),
        (Err(e), Err(close_err)) => {
            warn!(block, error = %close_err, "closing snapshot failed after an earlier error");
            Err(e)
        }
    }
}

fn replay_records<T>(
    batch: &Batch<T>,
    snapshot: &mut dyn StateBackend,
    processor: &dyn Processor<T>,
    telemetry: &Telemetry,
) -> Result<()> {
    let block = batch.block();
    let mut ctx = RunContext::new(snapshot);
    ctx.backend()
        .begin_block(block)
        .map_err(|e| ReplayError::processing(block, None, e))?;

    for record in batch.records() {
        let tx = record.transaction;
        ctx.backend()
            .begin_transaction(tx)
            .map_err(|e| ReplayError::processing(block, Some(tx), e))?;
        ctx.take_work_units();
        processor
            .process(record, &mut ctx)
            .map_err(|e| ReplayError::processing(block, Some(tx), e))?;
        ctx.backend()
            .end_transaction()
            .map_err(|e| ReplayError::processing(block, Some(tx), e))?;
        let _ = telemetry.transactions.send(ctx.take_work_units());
    }

    ctx.backend()
        .end_block()
        .map_err(|e| ReplayError::processing(block, None, e))?;
    let _ = telemetry.blocks.send(block);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;
    use crate::processor::from_fn;
    use crate::source::VecSource;
    use replay_types::Address;
    use state_backend::InMemoryBackend;

    /// Archive with empty blocks `0..=last` committed.
    fn committed_archive(last: u64) -> InMemoryBackend {
        let mut backend = InMemoryBackend::new().with_archive();
        for block in 0..=last {
            backend.begin_block(block).unwrap();
            backend.end_block().unwrap();
        }
        backend
    }

    fn records(blocks: std::ops::RangeInclusive<u64>, per_block: u32) -> VecSource<u64> {
        blocks
            .flat_map(|b| (0..per_block).map(move |t| TransactionRecord::new(b, t, b)))
            .collect()
    }

    fn config(workers: usize, last: u64) -> ArchiveConfig {
        ArchiveConfig {
            first_block: 1,
            last_block: last,
            workers,
            report: None,
            state_dir: None,
        }
    }

    #[test]
    fn test_replays_every_block_and_transaction() {
        let backend = committed_archive(50);
        let processor = from_fn(|record: &TransactionRecord<u64>, ctx: &mut RunContext<'_>| {
            ctx.backend()
                .set_balance(&Address::from_low_u64(record.payload), 1)?;
            ctx.record_work(7);
            Ok(())
        });
        let replay = ArchiveReplay::new(config(3, 50), Arc::new(processor));

        let summary = replay
            .run(&mut records(1..=50, 2), &backend)
            .unwrap();

        assert_eq!(summary.blocks, 50);
        assert_eq!(summary.transactions, 100);
        assert_eq!(summary.work_units, 700);
        assert_eq!(summary.skipped_batches, 0);
    }

    #[test]
    fn test_failing_block_does_not_stop_earlier_blocks() {
        // One worker processes batches strictly in order, so every block before
        // the failing one completes.
        let backend = committed_archive(20);
        let processor = from_fn(|record: &TransactionRecord<u64>, _: &mut RunContext<'_>| {
            if record.block == 7 && record.transaction == 1 {
                bail!("injected failure");
            }
            Ok(())
        });
        let replay = ArchiveReplay::new(config(1, 20), Arc::new(processor));

        let err = replay.run(&mut records(1..=20, 3), &backend).unwrap_err();
        match classify(&err) {
            Some(ReplayError::Processing {
                block: 7,
                transaction: Some(1),
                ..
            }) => {}
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(err
            .to_string()
            .starts_with("processing of transaction 7/1 failed"));
    }

    #[test]
    fn test_block_zero_has_no_pre_state() {
        let backend = committed_archive(3);
        let processor = from_fn(|_: &TransactionRecord<u64>, _: &mut RunContext<'_>| Ok(()));
        let mut cfg = config(2, 3);
        cfg.first_block = 0;
        let replay = ArchiveReplay::new(cfg, Arc::new(processor));

        let err = replay.run(&mut records(0..=3, 1), &backend).unwrap_err();
        assert!(matches!(
            classify(&err),
            Some(ReplayError::Snapshot { block: 0, .. })
        ));
    }

    #[test]
    fn test_worker_panic_is_reported_not_propagated() {
        let backend = committed_archive(200);
        let processor = from_fn(|record: &TransactionRecord<u64>, _: &mut RunContext<'_>| {
            if record.block == 3 {
                panic!("processor exploded");
            }
            Ok(())
        });
        let replay = ArchiveReplay::new(config(2, 200), Arc::new(processor));

        let err = replay.run(&mut records(1..=200, 1), &backend).unwrap_err();
        match classify(&err) {
            Some(ReplayError::WorkerPanic { message, .. }) => {
                assert_eq!(message, "processor exploded")
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_zero_workers_rejected() {
        let backend = committed_archive(3);
        let processor = from_fn(|_: &TransactionRecord<u64>, _: &mut RunContext<'_>| Ok(()));
        let replay = ArchiveReplay::new(config(0, 3), Arc::new(processor));
        assert!(replay.run(&mut records(1..=3, 1), &backend).is_err());
    }

    #[test]
    fn test_out_of_order_source_is_a_source_error() {
        let backend = committed_archive(10);
        let processor = from_fn(|_: &TransactionRecord<u64>, _: &mut RunContext<'_>| Ok(()));
        let replay = ArchiveReplay::new(config(2, 10), Arc::new(processor));
        let mut source = VecSource::new(vec![
            TransactionRecord::new(2, 0, 0),
            TransactionRecord::new(1, 0, 0),
        ]);
        let err = replay.run(&mut source, &backend).unwrap_err();
        assert!(matches!(
            classify(&err),
            Some(ReplayError::OutOfOrder { .. })
        ));
    }
}
