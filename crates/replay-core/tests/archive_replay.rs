//! Parallel archive replay over a real archive backend.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use parking_lot::Mutex;
use replay_core::{
    classify, from_fn, ArchiveConfig, ArchiveReplay, ReplayError, RunContext, VecSource,
};
use replay_types::{Address, TransactionRecord};
use state_backend::{ArchiveBackend, InMemoryBackend, LoggingBackend, StateBackend};

const COUNTER: u64 = 1;

/// Archive where account `COUNTER` holds `block` after every block.
fn history(last: u64) -> InMemoryBackend {
    let mut backend = InMemoryBackend::new().with_archive();
    for block in 0..=last {
        backend.begin_block(block).unwrap();
        backend.begin_transaction(0).unwrap();
        backend
            .set_balance(&Address::from_low_u64(COUNTER), block as u128)
            .unwrap();
        backend.end_transaction().unwrap();
        backend.end_block().unwrap();
    }
    backend
}

fn source(first: u64, last: u64, per_block: u32) -> VecSource<u64> {
    (first..=last)
        .flat_map(|b| (0..per_block).map(move |t| TransactionRecord::new(b, t, b)))
        .collect()
}

fn config(workers: usize, first: u64, last: u64) -> ArchiveConfig {
    ArchiveConfig {
        first_block: first,
        last_block: last,
        workers,
        report: None,
        state_dir: None,
    }
}

/// Checks that every transaction sees the pre-state of its block, advances
/// the counter, and records finished blocks.
fn checking_processor(
    completed: Arc<Mutex<BTreeSet<u64>>>,
    fail_block: Option<u64>,
    per_block: u32,
) -> impl replay_core::Processor<u64> {
    from_fn(move |record: &TransactionRecord<u64>, ctx: &mut RunContext<'_>| -> Result<()> {
        let counter = Address::from_low_u64(COUNTER);
        let seen = ctx.backend_ref().get_balance(&counter)?;
        let expected = record.block as u128 - 1 + record.transaction as u128;
        if seen != expected {
            bail!(
                "block {} tx {} saw counter {}, expected {}",
                record.block,
                record.transaction,
                seen,
                expected
            );
        }
        if Some(record.block) == fail_block {
            bail!("injected failure");
        }
        ctx.backend().set_balance(&counter, seen + 1)?;
        ctx.record_work(21_000);
        if record.transaction + 1 == per_block {
            completed.lock().insert(record.block);
        }
        Ok(())
    })
}

#[test]
fn every_block_replays_on_its_own_pre_state() {
    let backend = history(300);
    let completed = Arc::new(Mutex::new(BTreeSet::new()));
    let replay = ArchiveReplay::new(
        config(4, 1, 300),
        Arc::new(checking_processor(completed.clone(), None, 3)),
    );

    let summary = replay.run(&mut source(1, 300, 3), &backend).unwrap();

    assert_eq!(summary.blocks, 300);
    assert_eq!(summary.transactions, 900);
    assert_eq!(summary.work_units, 900 * 21_000);
    assert_eq!(summary.skipped_batches, 0);
    assert_eq!(completed.lock().len(), 300);
    // Snapshots are isolated: the archive itself is unchanged.
    let snapshot = backend.open_archive_snapshot(150).unwrap();
    assert_eq!(
        snapshot.get_balance(&Address::from_low_u64(COUNTER)).unwrap(),
        150
    );
}

#[test]
fn injected_failure_terminates_run_without_hanging() {
    let backend = history(1000);
    let completed = Arc::new(Mutex::new(BTreeSet::new()));
    let replay = ArchiveReplay::new(
        config(4, 1, 1000),
        Arc::new(checking_processor(completed.clone(), Some(500), 1)),
    );

    let err = replay.run(&mut source(1, 1000, 1), &backend).unwrap_err();

    match classify(&err) {
        Some(ReplayError::Processing {
            block: 500,
            transaction: Some(0),
            ..
        }) => {}
        other => panic!("unexpected error: {:?}", other),
    }
    let completed = completed.lock();
    assert!(!completed.contains(&500));
    // Batches leave the queue in block order and a failing worker cancels at
    // once, so only batches other workers had taken but not started are lost.
    let other_workers = 3;
    assert!(completed.range(..500).count() >= 499 - other_workers);
}

#[test]
fn panicking_batch_still_closes_its_snapshot() {
    let backend = LoggingBackend::new(history(5), "archive");
    let handles = backend.handles();
    let processor = from_fn(|record: &TransactionRecord<u64>, _: &mut RunContext<'_>| -> Result<()> {
        if record.block == 3 {
            panic!("processor exploded");
        }
        Ok(())
    });
    let replay = ArchiveReplay::new(config(1, 1, 5), Arc::new(processor));

    let err = replay.run(&mut source(1, 5, 1), &backend).unwrap_err();

    assert!(matches!(
        classify(&err),
        Some(ReplayError::WorkerPanic { .. })
    ));
    assert_eq!(handles.opened(), 3);
    assert_eq!(handles.closed(), 3);
}

#[test]
fn failure_opens_no_new_snapshots_and_skips_queued_batches() {
    let backend = LoggingBackend::new(history(200), "archive");
    let handles = backend.handles();
    let failed = Arc::new(AtomicBool::new(false));
    let opened_at_failure = Arc::new(AtomicU64::new(0));
    let processor = {
        let handles = handles.clone();
        let failed = failed.clone();
        let opened_at_failure = opened_at_failure.clone();
        from_fn(move |record: &TransactionRecord<u64>, _: &mut RunContext<'_>| -> Result<()> {
            if record.block == 1 {
                // Let the producer fill the queue first.
                thread::sleep(Duration::from_millis(50));
                opened_at_failure.store(handles.opened(), Ordering::SeqCst);
                failed.store(true, Ordering::SeqCst);
                bail!("injected failure");
            }
            let deadline = Instant::now() + Duration::from_secs(5);
            while !failed.load(Ordering::SeqCst) && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(1));
            }
            thread::sleep(Duration::from_millis(100));
            Ok(())
        })
    };
    let replay = ArchiveReplay::new(config(2, 1, 200), Arc::new(processor));

    let outcome = replay.run_outcome(&mut source(1, 200, 1), &backend);

    let err = outcome.error.expect("run must fail");
    assert_eq!(classify(&err).and_then(ReplayError::block), Some(1));
    assert!(outcome.summary.skipped_batches > 0);
    // At most the other worker's batch can slip past the failure.
    assert!(handles.opened() <= opened_at_failure.load(Ordering::SeqCst) + 1);
    assert_eq!(handles.opened(), handles.closed());
    assert!(outcome.summary.blocks < 200);
}

#[test]
fn single_worker_completes_every_block_before_the_failure() {
    let backend = history(100);
    let completed = Arc::new(Mutex::new(BTreeSet::new()));
    let replay = ArchiveReplay::new(
        config(1, 1, 100),
        Arc::new(checking_processor(completed.clone(), Some(40), 2)),
    );

    assert!(replay.run(&mut source(1, 100, 2), &backend).is_err());

    let completed = completed.lock();
    assert_eq!(
        completed.iter().copied().take_while(|b| *b < 40).count(),
        39
    );
    assert!(!completed.contains(&40));
}

#[test]
fn no_deadlock_for_any_worker_count() {
    let backend = history(200);
    for workers in [1, 2, 3, 8, 16] {
        let completed = Arc::new(Mutex::new(BTreeSet::new()));
        let replay = ArchiveReplay::new(
            config(workers, 1, 200),
            Arc::new(checking_processor(completed, Some(1), 1)),
        );
        let err = replay.run(&mut source(1, 200, 1), &backend).unwrap_err();
        assert_eq!(classify(&err).and_then(ReplayError::block), Some(1));
    }
}

#[test]
fn missing_archive_state_is_a_snapshot_error() {
    // Archive only reaches block 10.
    let backend = history(10);
    let completed = Arc::new(Mutex::new(BTreeSet::new()));
    let replay = ArchiveReplay::new(
        config(2, 1, 20),
        Arc::new(checking_processor(completed, None, 1)),
    );

    let err = replay.run(&mut source(1, 20, 1), &backend).unwrap_err();
    match classify(&err) {
        Some(ReplayError::Snapshot { block, .. }) => assert!(*block > 11),
        other => panic!("unexpected error: {:?}", other),
    }
}

#[test]
fn external_cancellation_stops_the_run() {
    let backend = history(50);
    let completed = Arc::new(Mutex::new(BTreeSet::new()));
    let replay = ArchiveReplay::new(
        config(2, 1, 50),
        Arc::new(checking_processor(completed, None, 1)),
    );
    replay.cancellation_token().cancel();

    let err = replay.run(&mut source(1, 50, 1), &backend).unwrap_err();
    assert!(err.to_string().starts_with("archive replay cancelled"));
}
