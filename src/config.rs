//! Run configuration.
//!
//! A [`ReplayConfig`] is read from a JSON file (every field optional),
//! adjusted by `REPLAY_*` environment variables, validated, and then split
//! into the engine-level configs. The engine crates never read files or the
//! environment themselves.
//!
//! ```ignore
//! let config = ReplayConfig::load(Some(Path::new("replay.json")))?;
//! let pipeline = SequentialPipeline::new(config.to_pipeline_config(), processor);
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use replay_core::extensions::{ErrorLogger, ProgressTracker, StatePrimer};
use replay_core::{ArchiveConfig, Extension, PipelineConfig, ReportPolicy};
use replay_types::env_utils::{env_bool, env_path, env_var};
use replay_types::UpdateSet;
use serde::{Deserialize, Serialize};
use state_backend::{MismatchPolicy, PrimeConfig, DEFAULT_BULK_COMMIT_OPS};

/// Default number of archive replay workers.
pub fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|v| v.get())
        .unwrap_or(4)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReplayConfig {
    pub first_block: u64,
    pub last_block: u64,
    /// Archive replay worker threads.
    pub workers: usize,
    /// Blocks per epoch in sequential mode; `None` disables epoch brackets.
    pub epoch_length: Option<u64>,
    pub track_progress: bool,
    /// Minimum seconds between archive replay reports.
    pub progress_interval_secs: u64,
    /// Sequential reports fire every this many blocks.
    pub progress_block_frequency: u64,
    /// Collect transaction errors instead of stopping at the first one.
    pub continue_on_failure: bool,
    /// Append collected errors to this file.
    pub error_log: Option<PathBuf>,
    pub skip_priming: bool,
    /// Flush threshold of the priming buffer; `None` loads everything at once.
    pub prime_buffer_bytes: Option<u64>,
    pub prime_random: bool,
    pub prime_seed: u64,
    /// Bulk load operations between implicit commits.
    pub bulk_commit_ops: u64,
    /// Run a second backend in shadow mode and compare every read.
    pub shadow: bool,
    /// Turn shadow mismatches into errors.
    pub fail_on_mismatch: bool,
    /// Directory whose size is reported as disk usage.
    pub state_dir: Option<PathBuf>,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            first_block: 0,
            last_block: u64::MAX,
            workers: default_workers(),
            epoch_length: None,
            track_progress: true,
            progress_interval_secs: 15,
            progress_block_frequency: 100_000,
            continue_on_failure: false,
            error_log: None,
            skip_priming: false,
            prime_buffer_bytes: None,
            prime_random: false,
            prime_seed: 0,
            bulk_commit_ops: DEFAULT_BULK_COMMIT_OPS,
            shadow: false,
            fail_on_mismatch: false,
            state_dir: None,
        }
    }
}

impl ReplayConfig {
    /// Read a JSON config file. Missing fields take their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        serde_json::from_str(&data)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    /// File (or defaults), then environment overrides, then validation.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Override fields from `REPLAY_*` environment variables.
    ///
    /// Unset or unparsable variables leave the field unchanged.
    pub fn apply_env_overrides(&mut self) {
        if let Some(v) = env_var("REPLAY_FIRST_BLOCK") {
            self.first_block = v;
        }
        if let Some(v) = env_var("REPLAY_LAST_BLOCK") {
            self.last_block = v;
        }
        if let Some(v) = env_var("REPLAY_WORKERS") {
            self.workers = v;
        }
        if let Some(v) = env_var("REPLAY_EPOCH_LENGTH") {
            self.epoch_length = Some(v);
        }
        if let Some(v) = env_bool("REPLAY_TRACK_PROGRESS") {
            self.track_progress = v;
        }
        if let Some(v) = env_var("REPLAY_PROGRESS_INTERVAL_SECS") {
            self.progress_interval_secs = v;
        }
        if let Some(v) = env_var("REPLAY_PROGRESS_BLOCK_FREQUENCY") {
            self.progress_block_frequency = v;
        }
        if let Some(v) = env_bool("REPLAY_CONTINUE_ON_FAILURE") {
            self.continue_on_failure = v;
        }
        if let Some(v) = env_path("REPLAY_ERROR_LOG") {
            self.error_log = Some(v);
        }
        if let Some(v) = env_bool("REPLAY_SKIP_PRIMING") {
            self.skip_priming = v;
        }
        if let Some(v) = env_var("REPLAY_PRIME_BUFFER_BYTES") {
            self.prime_buffer_bytes = Some(v);
        }
        if let Some(v) = env_bool("REPLAY_PRIME_RANDOM") {
            self.prime_random = v;
        }
        if let Some(v) = env_var("REPLAY_PRIME_SEED") {
            self.prime_seed = v;
        }
        if let Some(v) = env_var("REPLAY_BULK_COMMIT_OPS") {
            self.bulk_commit_ops = v;
        }
        if let Some(v) = env_bool("REPLAY_SHADOW") {
            self.shadow = v;
        }
        if let Some(v) = env_bool("REPLAY_FAIL_ON_MISMATCH") {
            self.fail_on_mismatch = v;
        }
        if let Some(v) = env_path("REPLAY_STATE_DIR") {
            self.state_dir = Some(v);
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.first_block > self.last_block {
            bail!(
                "first block {} is after last block {}",
                self.first_block,
                self.last_block
            );
        }
        if self.workers == 0 {
            bail!("workers must be at least 1");
        }
        if self.epoch_length == Some(0) {
            bail!("epoch length must be at least 1");
        }
        if self.progress_block_frequency == 0 {
            bail!("progress block frequency must be at least 1");
        }
        if self.bulk_commit_ops == 0 {
            bail!("bulk commit ops must be at least 1");
        }
        Ok(())
    }

    pub fn to_pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            first_block: self.first_block,
            last_block: self.last_block,
            epoch_length: self.epoch_length,
        }
    }

    pub fn to_archive_config(&self) -> ArchiveConfig {
        ArchiveConfig {
            first_block: self.first_block,
            last_block: self.last_block,
            workers: self.workers,
            report: self.track_progress.then(|| self.archive_report_policy()),
            state_dir: self.state_dir.clone(),
        }
    }

    pub fn to_prime_config(&self) -> PrimeConfig {
        PrimeConfig {
            buffer_bytes: self.prime_buffer_bytes.unwrap_or(u64::MAX),
            random: self.prime_random,
            seed: self.prime_seed,
        }
    }

    /// Time-driven reports for the parallel engine.
    pub fn archive_report_policy(&self) -> ReportPolicy {
        ReportPolicy {
            min_interval: Duration::from_secs(self.progress_interval_secs),
            block_frequency: 1,
        }
    }

    /// Block-driven reports for the sequential pipeline.
    pub fn sequential_report_policy(&self) -> ReportPolicy {
        ReportPolicy {
            min_interval: Duration::ZERO,
            block_frequency: self.progress_block_frequency,
        }
    }

    pub fn mismatch_policy(&self) -> MismatchPolicy {
        if self.fail_on_mismatch {
            MismatchPolicy::Fail
        } else {
            MismatchPolicy::Report
        }
    }

    /// The standard extension set of a sequential run, in hook order:
    /// priming, progress tracking, error collection.
    pub fn extensions<T>(&self, updates: Vec<UpdateSet>) -> Vec<Box<dyn Extension<T>>> {
        let mut extensions: Vec<Box<dyn Extension<T>>> = vec![Box::new(
            StatePrimer::new(self.to_prime_config(), updates).skip(self.skip_priming),
        )];
        if self.track_progress {
            let mut tracker = ProgressTracker::new(self.sequential_report_policy());
            if let Some(dir) = &self.state_dir {
                tracker = tracker.with_state_dir(dir);
            }
            extensions.push(Box::new(tracker));
        }
        if self.continue_on_failure {
            let mut logger = ErrorLogger::new();
            if let Some(path) = &self.error_log {
                logger = logger.with_log_file(path);
            }
            extensions.push(Box::new(logger));
        }
        extensions
    }
}
