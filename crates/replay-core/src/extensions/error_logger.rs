//! Collection of non-fatal transaction errors.
//!
//! In continue-on-failure mode processors hand failed transactions to
//! [`RunContext::report_error`] instead of aborting the run. The
//! [`ErrorLogger`] installs the sink those errors flow into, drains it on a
//! background thread, and turns the collected errors into a single failure
//! once the run ends.

use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError};
use tracing::{error, warn};

use crate::context::{ExecutionState, RunContext};
use crate::extension::Extension;

/// How long `PostRun` waits for the drain thread.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// What the drain thread saw.
#[derive(Debug, Default)]
struct Collected {
    count: u64,
    first: Option<String>,
    write_error: Option<String>,
}

/// Logs every reported error and fails the run if there was any.
pub struct ErrorLogger {
    log_file: Option<PathBuf>,
    timeout: Duration,
    done: Option<Receiver<Collected>>,
}

impl ErrorLogger {
    pub fn new() -> Self {
        Self {
            log_file: None,
            timeout: DRAIN_TIMEOUT,
            done: None,
        }
    }

    /// Also append each error as one line to `path`.
    pub fn with_log_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_file = Some(path.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl Default for ErrorLogger {
    fn default() -> Self {
        Self::new()
    }
}

fn drain(errors: Receiver<anyhow::Error>, log_file: Option<&Path>) -> Collected {
    let mut collected = Collected::default();
    let mut writer = match log_file.map(open_log).transpose() {
        Ok(writer) => writer,
        Err(e) => {
            collected.write_error = Some(format!("{:#}", e));
            None
        }
    };

    for err in errors.iter() {
        let message = format!("{:#}", err);
        error!(error = %message, "transaction failed");
        if let Some(w) = writer.as_mut() {
            if let Err(e) = writeln!(w, "{}", message) {
                collected.write_error = Some(e.to_string());
                writer = None;
            }
        }
        collected.count += 1;
        if collected.first.is_none() {
            collected.first = Some(message);
        }
    }

    if let Some(mut w) = writer {
        if let Err(e) = w.flush() {
            collected.write_error = Some(e.to_string());
        }
    }
    collected
}

fn open_log(path: &Path) -> Result<BufWriter<std::fs::File>> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("cannot open error log {}", path.display()))?;
    Ok(BufWriter::new(file))
}

impl<T> Extension<T> for ErrorLogger {
    fn pre_run(&mut self, _state: ExecutionState<'_, T>, ctx: &mut RunContext<'_>) -> Result<()> {
        let (sink, errors) = unbounded();
        let (done_tx, done_rx) = bounded(1);
        let log_file = self.log_file.clone();
        thread::Builder::new()
            .name("replay-error-logger".into())
            .spawn(move || {
                let collected = drain(errors, log_file.as_deref());
                let _ = done_tx.send(collected);
            })
            .context("cannot start error logger thread")?;
        ctx.set_error_sink(sink);
        self.done = Some(done_rx);
        Ok(())
    }

    fn post_run(
        &mut self,
        _state: ExecutionState<'_, T>,
        ctx: &mut RunContext<'_>,
        _err: Option<&anyhow::Error>,
    ) -> Result<()> {
        // Dropping the sender ends the drain loop.
        drop(ctx.clear_error_sink());
        let Some(done) = self.done.take() else {
            return Ok(());
        };

        let collected = match done.recv_timeout(self.timeout) {
            Ok(collected) => collected,
            Err(RecvTimeoutError::Timeout) => {
                warn!(timeout_secs = self.timeout.as_secs(), "error logger did not finish in time");
                return Err(anyhow!(
                    "error logger did not finish within {:?}",
                    self.timeout
                ));
            }
            Err(RecvTimeoutError::Disconnected) => {
                return Err(anyhow!("error logger thread terminated unexpectedly"));
            }
        };

        if let Some(write_error) = &collected.write_error {
            warn!(error = %write_error, "cannot write error log");
        }
        match collected.first {
            Some(first) => Err(anyhow!(
                "total {} errors occurred: {}",
                collected.count,
                first
            )),
            None => Ok(()),
        }
    }

    fn name(&self) -> String {
        "ErrorLogger".to_string()
    }
}
