//! Archive snapshots opened concurrently from several threads.

use std::sync::Arc;
use std::thread;

use replay_types::{Account, Address, UpdateSet};
use state_backend::{
    ArchiveBackend, CodeHashCache, InMemoryBackend, MismatchPolicy, Primer, ShadowBackend,
    StateBackend, ValidationLog,
};

fn history(blocks: u64) -> InMemoryBackend {
    let mut backend = InMemoryBackend::new().with_archive();
    for block in 1..=blocks {
        backend.begin_block(block).unwrap();
        backend.begin_transaction(0).unwrap();
        backend
            .set_balance(&Address::from_low_u64(1), block as u128 * 10)
            .unwrap();
        backend.set_code(&Address::from_low_u64(2), b"\x00").unwrap();
        backend.end_transaction().unwrap();
        backend.end_block().unwrap();
    }
    backend
}

#[test]
fn concurrent_snapshots_see_their_own_block() {
    let cache = Arc::new(CodeHashCache::new());
    let backend = history(32).with_code_cache(Arc::clone(&cache));

    thread::scope(|scope| {
        for worker in 0..4u64 {
            let backend = &backend;
            scope.spawn(move || {
                for block in (1..=32).filter(|b| b % 4 == worker) {
                    let mut snapshot = backend.open_archive_snapshot(block).unwrap();
                    assert_eq!(
                        snapshot.get_balance(&Address::from_low_u64(1)).unwrap(),
                        block as u128 * 10
                    );
                    snapshot.get_code_hash(&Address::from_low_u64(2)).unwrap();

                    // Writes on a snapshot never reach the archive.
                    snapshot.begin_block(block + 1).unwrap();
                    snapshot.begin_transaction(0).unwrap();
                    snapshot
                        .set_balance(&Address::from_low_u64(1), 0)
                        .unwrap();
                    snapshot.end_transaction().unwrap();
                    snapshot.end_block().unwrap();
                    snapshot.close().unwrap();
                }
            });
        }
    });

    let check = backend.open_archive_snapshot(16).unwrap();
    assert_eq!(check.get_balance(&Address::from_low_u64(1)).unwrap(), 160);
    // One entry for account 2's code, shared by every worker.
    assert_eq!(cache.len(), 1);
}

#[test]
fn primed_shadow_pair_replays_without_mismatch() {
    let log = ValidationLog::new();
    let mut backend = ShadowBackend::new(
        InMemoryBackend::new().with_archive(),
        InMemoryBackend::new().with_archive(),
    )
    .with_log(log.clone())
    .with_policy(MismatchPolicy::Fail);

    let genesis = UpdateSet::new(
        0,
        (1..=5u64)
            .map(|i| (Address::from_low_u64(i), Account::with_balance(100)))
            .collect(),
    );
    Primer::default()
        .prime(&mut backend, vec![genesis], 0)
        .unwrap();

    backend.begin_block(1).unwrap();
    backend.begin_transaction(0).unwrap();
    let from = Address::from_low_u64(1);
    let to = Address::from_low_u64(2);
    let balance = backend.get_balance(&from).unwrap();
    backend.set_balance(&from, balance - 30).unwrap();
    let balance = backend.get_balance(&to).unwrap();
    backend.set_balance(&to, balance + 30).unwrap();
    backend.end_transaction().unwrap();
    backend.end_block().unwrap();

    let snapshot = backend.open_archive_snapshot(0).unwrap();
    assert_eq!(snapshot.get_balance(&from).unwrap(), 100);
    let snapshot = backend.open_archive_snapshot(1).unwrap();
    assert_eq!(snapshot.get_balance(&to).unwrap(), 130);

    backend.close().unwrap();
    backend.close().unwrap();
    assert!(log.is_empty());
}
