//! Synthetic history replayed sequentially, then in parallel on the archive
//! the sequential run produced.

use std::collections::BTreeMap;
use std::sync::Arc;

use statedb_replay::replay_core::{classify, ArchiveReplay, ReplayError, SequentialPipeline};
use statedb_replay::replay_types::Address;
use statedb_replay::state_backend::{
    InMemoryBackend, MismatchPolicy, ShadowBackend, StateBackend, ValidationLog,
};
use statedb_replay::synthetic::{
    HistoryParams, SyntheticHistory, TransferProcessor, TRANSFER_GAS,
};
use statedb_replay::ReplayConfig;

fn params() -> HistoryParams {
    HistoryParams {
        first_block: 1,
        last_block: 40,
        accounts: 12,
        transactions_per_block: 5,
        ..HistoryParams::default()
    }
}

fn config() -> ReplayConfig {
    ReplayConfig {
        first_block: 1,
        last_block: 40,
        workers: 4,
        track_progress: false,
        ..ReplayConfig::default()
    }
}

fn archive_backend() -> InMemoryBackend {
    InMemoryBackend::new().with_archive()
}

fn run_sequential(
    config: &ReplayConfig,
    history: &SyntheticHistory,
    backend: &mut dyn StateBackend,
) {
    let mut pipeline =
        SequentialPipeline::new(config.to_pipeline_config(), Arc::new(TransferProcessor::new()));
    for extension in config.extensions(vec![history.genesis.clone()]) {
        pipeline.add_extension(extension);
    }
    let summary = pipeline.run(&mut history.source(), backend).unwrap();
    assert_eq!(summary.transactions, history.len() as u64);
}

/// Balances after applying every transfer to the genesis state.
fn expected_balances(history: &SyntheticHistory) -> BTreeMap<Address, u128> {
    let mut balances: BTreeMap<Address, u128> = history
        .genesis
        .accounts
        .iter()
        .map(|(address, account)| (*address, account.balance))
        .collect();
    for record in &history.records {
        let transfer = record.payload;
        *balances.entry(transfer.from).or_default() -= transfer.amount;
        *balances.entry(transfer.to).or_default() += transfer.amount;
    }
    balances
}

#[test]
fn sequential_then_archive_replay() {
    let history = SyntheticHistory::generate(&params()).unwrap();
    let config = config();
    let mut backend = archive_backend();

    run_sequential(&config, &history, &mut backend);

    assert_eq!(backend.last_committed_block(), Some(40));
    assert_eq!(backend.archived_blocks(), (0..=40).collect::<Vec<_>>());
    let actual: BTreeMap<Address, u128> = backend
        .world_state()
        .iter()
        .map(|(address, account)| (*address, account.balance))
        .collect();
    assert_eq!(actual, expected_balances(&history));

    let replay = ArchiveReplay::new(config.to_archive_config(), Arc::new(TransferProcessor::new()));
    let summary = replay.run(&mut history.source(), &backend.reopen()).unwrap();
    assert_eq!(summary.blocks, 40);
    assert_eq!(summary.transactions, 200);
    assert_eq!(summary.work_units, 200 * TRANSFER_GAS);
    assert_eq!(summary.skipped_batches, 0);
}

#[test]
fn shadowed_runs_agree() {
    let history = SyntheticHistory::generate(&params()).unwrap();
    let config = config();
    let log = ValidationLog::new();
    let mut backend = ShadowBackend::new(archive_backend(), archive_backend())
        .with_log(log.clone())
        .with_policy(MismatchPolicy::Fail);

    run_sequential(&config, &history, &mut backend);
    assert!(log.is_empty());

    let (primary, shadow) = backend.into_inner();
    assert_eq!(primary.world_state(), shadow.world_state());

    let archive = ShadowBackend::new(primary.reopen(), shadow.reopen())
        .with_log(log.clone())
        .with_policy(MismatchPolicy::Fail);
    let replay = ArchiveReplay::new(config.to_archive_config(), Arc::new(TransferProcessor::new()));
    let summary = replay.run(&mut history.source(), &archive).unwrap();
    assert_eq!(summary.blocks, 40);
    assert!(log.is_empty());
}

#[test]
fn injected_failure_stops_archive_replay() {
    let history = SyntheticHistory::generate(&params()).unwrap();
    let config = config();
    let mut backend = archive_backend();
    run_sequential(&config, &history, &mut backend);

    let replay = ArchiveReplay::new(
        config.to_archive_config(),
        Arc::new(TransferProcessor::failing_at(Some(25))),
    );
    let err = replay
        .run(&mut history.source(), &backend.reopen())
        .unwrap_err();
    match classify(&err) {
        Some(ReplayError::Processing {
            block, transaction, ..
        }) => {
            assert_eq!(*block, 25);
            assert_eq!(*transaction, Some(0));
        }
        other => panic!("unexpected error: {:?}", other),
    }
}
