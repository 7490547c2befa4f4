//! Replay benchmark over a synthetic transfer history.
//!
//! Replays the history sequentially into an archive-enabled in-memory backend
//! (optionally shadowed by a second one), then replays it again with the
//! parallel archive engine against the archive the first run produced.
//! Prints a JSON summary to stdout; logs go to stderr.
//!
//! ```text
//! replay-bench --last-block 5000 --workers 8 --shadow
//! RUST_LOG=debug replay-bench --config replay.json --inject-failure 1200
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

use statedb_replay::replay_core::{ArchiveReplay, SequentialPipeline};
use statedb_replay::state_backend::{
    ArchiveBackend, InMemoryBackend, ShadowBackend, StateBackend, ValidationLog,
};
use statedb_replay::synthetic::{HistoryParams, SyntheticHistory, TransferProcessor};
use statedb_replay::ReplayConfig;

/// Used when neither the config nor the command line bounds the range.
const DEFAULT_LAST_BLOCK: u64 = 1_000;

#[derive(Parser, Debug)]
#[command(name = "replay-bench")]
struct Args {
    /// JSON config file (see ReplayConfig)
    #[arg(long)]
    config: Option<PathBuf>,

    /// First block with transactions (at least 1)
    #[arg(long)]
    first_block: Option<u64>,

    /// Last block with transactions
    #[arg(long)]
    last_block: Option<u64>,

    /// Archive replay worker threads
    #[arg(long)]
    workers: Option<usize>,

    /// Number of synthetic accounts
    #[arg(long, default_value_t = 1_000)]
    accounts: u64,

    /// Transfers per block
    #[arg(long, default_value_t = 10)]
    tx_per_block: u32,

    /// Seed of the synthetic history
    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Shadow the primary backend with a second one and compare every read
    #[arg(long, default_value_t = false)]
    shadow: bool,

    /// Fail every transaction of this block during the archive replay
    #[arg(long)]
    inject_failure: Option<u64>,

    /// Only run the sequential phase
    #[arg(long, default_value_t = false)]
    skip_archive: bool,
}

#[derive(Debug, Serialize)]
struct PhaseReport {
    blocks: u64,
    transactions: u64,
    work_units: u64,
    elapsed_secs: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    skipped_batches: Option<u64>,
}

#[derive(Debug, Serialize)]
struct BenchReport {
    records: usize,
    sequential: PhaseReport,
    #[serde(skip_serializing_if = "Option::is_none")]
    archive: Option<PhaseReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    shadow_mismatches: Option<usize>,
}

fn init_tracing() {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    // Fails only if a global subscriber is already set.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn resolve_config(args: &Args) -> Result<ReplayConfig> {
    let mut config = ReplayConfig::load(args.config.as_deref())?;
    if let Some(first) = args.first_block {
        config.first_block = first;
    }
    // Block 0 is the genesis state.
    config.first_block = config.first_block.max(1);
    if let Some(last) = args.last_block {
        config.last_block = last;
    } else if config.last_block == u64::MAX {
        config.last_block = DEFAULT_LAST_BLOCK.max(config.first_block);
    }
    if let Some(workers) = args.workers {
        config.workers = workers;
    }
    config.shadow |= args.shadow;
    config.validate()?;
    Ok(config)
}

fn fresh_backend(config: &ReplayConfig) -> InMemoryBackend {
    InMemoryBackend::new()
        .with_archive()
        .with_bulk_commit_ops(config.bulk_commit_ops)
}

fn run_sequential(
    config: &ReplayConfig,
    history: &SyntheticHistory,
    backend: &mut dyn StateBackend,
) -> Result<PhaseReport> {
    let started = Instant::now();
    let mut pipeline =
        SequentialPipeline::new(config.to_pipeline_config(), Arc::new(TransferProcessor::new()));
    for extension in config.extensions(vec![history.genesis.clone()]) {
        pipeline.add_extension(extension);
    }
    let summary = pipeline
        .run(&mut history.source(), backend)
        .context("sequential replay failed")?;
    Ok(PhaseReport {
        blocks: summary.blocks,
        transactions: summary.transactions,
        work_units: summary.work_units,
        elapsed_secs: started.elapsed().as_secs_f64(),
        skipped_batches: None,
    })
}

fn run_archive<B: ArchiveBackend>(
    config: &ReplayConfig,
    history: &SyntheticHistory,
    backend: &B,
    inject_failure: Option<u64>,
) -> Result<PhaseReport> {
    let replay = ArchiveReplay::new(
        config.to_archive_config(),
        Arc::new(TransferProcessor::failing_at(inject_failure)),
    );
    let summary = replay
        .run(&mut history.source(), backend)
        .context("archive replay failed")?;
    Ok(PhaseReport {
        blocks: summary.blocks,
        transactions: summary.transactions,
        work_units: summary.work_units,
        elapsed_secs: summary.elapsed.as_secs_f64(),
        skipped_batches: Some(summary.skipped_batches),
    })
}

/// Close the archive handle of a finished phase. The phase error wins over a
/// close error.
fn close_after<T>(result: Result<T>, archive: &mut dyn StateBackend) -> Result<T> {
    let closed = archive.close();
    let value = result?;
    closed.context("closing archive backend failed")?;
    Ok(value)
}

fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();
    let config = resolve_config(&args)?;

    let history = SyntheticHistory::generate(&HistoryParams {
        first_block: config.first_block,
        last_block: config.last_block,
        accounts: args.accounts,
        transactions_per_block: args.tx_per_block,
        seed: args.seed,
        ..HistoryParams::default()
    })?;
    info!(
        first = config.first_block,
        last = config.last_block,
        records = history.len(),
        shadow = config.shadow,
        workers = config.workers,
        "generated synthetic history"
    );

    let report = if config.shadow {
        let log = ValidationLog::new();
        let mut backend = ShadowBackend::new(fresh_backend(&config), fresh_backend(&config))
            .with_log(log.clone())
            .with_policy(config.mismatch_policy());
        let sequential = run_sequential(&config, &history, &mut backend)?;

        let archive = if args.skip_archive {
            None
        } else {
            let (primary, shadow) = backend.into_inner();
            let mut archive = ShadowBackend::new(primary.reopen(), shadow.reopen())
                .with_log(log.clone())
                .with_policy(config.mismatch_policy());
            let result = run_archive(&config, &history, &archive, args.inject_failure);
            Some(close_after(result, &mut archive)?)
        };
        if !log.is_empty() {
            warn!(mismatches = log.len(), "shadow backend disagreed with primary");
        }
        BenchReport {
            records: history.len(),
            sequential,
            archive,
            shadow_mismatches: Some(log.len()),
        }
    } else {
        let mut backend = fresh_backend(&config);
        let sequential = run_sequential(&config, &history, &mut backend)?;
        let archive = if args.skip_archive {
            None
        } else {
            let mut archive = backend.reopen();
            let result = run_archive(&config, &history, &archive, args.inject_failure);
            Some(close_after(result, &mut archive)?)
        };
        BenchReport {
            records: history.len(),
            sequential,
            archive,
            shadow_mismatches: None,
        }
    };

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
