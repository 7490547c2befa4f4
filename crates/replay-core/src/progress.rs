//! Rate-limited progress aggregation.
//!
//! Workers and the sequential pipeline feed per-transaction and per-block
//! samples into a [`ProgressAggregator`]. Polling it yields a
//! [`ProgressReport`] only when enough wall-clock time has passed *and* the
//! highest completed block crossed a new reporting boundary. Counters reset
//! with every report, so rates are interval-local.

use std::fmt;
use std::path::Path;
use std::time::{Duration, Instant};

use tracing::info;

/// Log target of progress report lines.
pub const PROGRESS_TARGET: &str = "statedb_replay::progress";

/// Default wall-clock interval between archive replay reports.
pub const DEFAULT_REPORT_INTERVAL: Duration = Duration::from_secs(15);

/// Default block frequency of sequential progress reports.
pub const DEFAULT_BLOCK_FREQUENCY: u64 = 100_000;

/// When to emit a report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReportPolicy {
    /// Minimum wall-clock time between two reports.
    pub min_interval: Duration,
    /// Reports fire when the highest block crosses a multiple of this.
    pub block_frequency: u64,
}

impl ReportPolicy {
    /// Every 15 seconds, at any block.
    pub fn archive() -> Self {
        Self {
            min_interval: DEFAULT_REPORT_INTERVAL,
            block_frequency: 1,
        }
    }

    /// Every 100 000 blocks, regardless of time.
    pub fn sequential() -> Self {
        Self {
            min_interval: Duration::ZERO,
            block_frequency: DEFAULT_BLOCK_FREQUENCY,
        }
    }
}

impl Default for ReportPolicy {
    fn default() -> Self {
        Self::archive()
    }
}

/// One human-facing progress line.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressReport {
    pub block: u64,
    pub memory_bytes: Option<u64>,
    pub disk_bytes: Option<u64>,
    pub interval: Duration,
    pub transactions: u64,
    pub work_units: u64,
    pub total_transactions: u64,
    pub elapsed: Duration,
}

impl ProgressReport {
    pub fn transaction_rate(&self) -> f64 {
        rate(self.transactions, self.interval)
    }

    pub fn work_rate(&self) -> f64 {
        rate(self.work_units, self.interval)
    }

    /// Emit the report at `info` under [`PROGRESS_TARGET`].
    pub fn log(&self) {
        info!(
            target: PROGRESS_TARGET,
            block = self.block,
            total_transactions = self.total_transactions,
            elapsed_secs = self.elapsed.as_secs(),
            "{}",
            self
        );
    }
}

fn rate(count: u64, interval: Duration) -> f64 {
    let secs = interval.as_secs_f64();
    if secs <= 0.0 {
        return 0.0;
    }
    count as f64 / secs
}

struct Bytes(Option<u64>);

impl fmt::Display for Bytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(bytes) => write!(f, "{}", bytes),
            None => write!(f, "unknown"),
        }
    }
}

impl fmt::Display for ProgressReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Reached block {}; using ~ {} bytes of memory, ~ {} bytes of disk, \
             last interval rate ~ {:.2} Tx/s, ~ {:.2} Gas/s",
            self.block,
            Bytes(self.memory_bytes),
            Bytes(self.disk_bytes),
            self.transaction_rate(),
            self.work_rate()
        )
    }
}

/// Accumulates progress samples and decides when to report.
#[derive(Debug, Clone)]
pub struct ProgressAggregator {
    policy: ReportPolicy,
    started: Instant,
    last_report: Instant,
    last_reported_boundary: u64,
    highest_block: Option<u64>,
    interval_transactions: u64,
    interval_work: u64,
    total_transactions: u64,
    total_work: u64,
    total_blocks: u64,
}

impl ProgressAggregator {
    pub fn new(policy: ReportPolicy, first_block: u64, now: Instant) -> Self {
        let frequency = policy.block_frequency.max(1);
        Self {
            policy,
            started: now,
            last_report: now,
            last_reported_boundary: first_block - first_block % frequency,
            highest_block: None,
            interval_transactions: 0,
            interval_work: 0,
            total_transactions: 0,
            total_work: 0,
            total_blocks: 0,
        }
    }

    pub fn record_transaction(&mut self, work_units: u64) {
        self.interval_transactions += 1;
        self.interval_work = self.interval_work.saturating_add(work_units);
        self.total_transactions += 1;
        self.total_work = self.total_work.saturating_add(work_units);
    }

    /// Blocks may complete out of order; the highest one drives reporting.
    pub fn record_block(&mut self, block: u64) {
        self.total_blocks += 1;
        self.highest_block = Some(self.highest_block.map_or(block, |b| b.max(block)));
    }

    /// Produce a report if one is due, resetting the interval counters.
    ///
    /// `usage` is only called when a report is actually produced and returns
    /// `(memory_bytes, disk_bytes)`.
    pub fn poll<F>(&mut self, now: Instant, usage: F) -> Option<ProgressReport>
    where
        F: FnOnce() -> (Option<u64>, Option<u64>),
    {
        let block = self.highest_block?;
        let interval = now.saturating_duration_since(self.last_report);
        if interval < self.policy.min_interval {
            return None;
        }
        let frequency = self.policy.block_frequency.max(1);
        let boundary = block - block % frequency;
        if boundary <= self.last_reported_boundary {
            return None;
        }

        let (memory_bytes, disk_bytes) = usage();
        let report = ProgressReport {
            block,
            memory_bytes,
            disk_bytes,
            interval,
            transactions: self.interval_transactions,
            work_units: self.interval_work,
            total_transactions: self.total_transactions,
            elapsed: now.saturating_duration_since(self.started),
        };
        self.last_report = now;
        self.last_reported_boundary = boundary;
        self.interval_transactions = 0;
        self.interval_work = 0;
        Some(report)
    }

    pub fn total_transactions(&self) -> u64 {
        self.total_transactions
    }

    pub fn total_work(&self) -> u64 {
        self.total_work
    }

    pub fn total_blocks(&self) -> u64 {
        self.total_blocks
    }

    pub fn highest_block(&self) -> Option<u64> {
        self.highest_block
    }

    pub fn elapsed(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.started)
    }
}

/// Total size in bytes of all files below `path`.
///
/// Unreadable entries are skipped; a missing directory has size 0.
pub fn directory_size(path: &Path) -> u64 {
    let Ok(entries) = std::fs::read_dir(path) else {
        return 0;
    };
    entries
        .flatten()
        .map(|entry| match entry.metadata() {
            Ok(meta) if meta.is_dir() => directory_size(&entry.path()),
            Ok(meta) => meta.len(),
            Err(_) => 0,
        })
        .sum()
}
