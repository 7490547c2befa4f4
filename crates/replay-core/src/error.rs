//! Error taxonomy of the replay engines.
//!
//! Engines return `anyhow::Result`; fatal failures carry a [`ReplayError`]
//! that callers can recover with `downcast_ref` to classify what went wrong
//! and where.

use std::fmt;

use replay_types::TxPosition;
use state_backend::ValidationMismatch;

/// Extension lifecycle points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookKind {
    PreRun,
    PostRun,
    PreBlock,
    PostBlock,
    PreTransaction,
    PostTransaction,
}

impl fmt::Display for HookKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HookKind::PreRun => "PreRun",
            HookKind::PostRun => "PostRun",
            HookKind::PreBlock => "PreBlock",
            HookKind::PostBlock => "PostBlock",
            HookKind::PreTransaction => "PreTransaction",
            HookKind::PostTransaction => "PostTransaction",
        };
        f.write_str(name)
    }
}

/// A fatal replay failure.
#[derive(Debug)]
pub enum ReplayError {
    /// The record source failed to produce a record.
    Source { source: anyhow::Error },

    /// The record source violated strict `(block, transaction)` ordering.
    OutOfOrder {
        previous: TxPosition,
        next: TxPosition,
    },

    /// No archive snapshot could be opened for the pre-state of `block`.
    Snapshot { block: u64, source: anyhow::Error },

    /// The processor or a backend call failed.
    Processing {
        block: u64,
        /// `None` when the failure happened outside a transaction
        /// (for example in `begin_block`).
        transaction: Option<u32>,
        source: anyhow::Error,
    },

    /// An extension hook failed.
    Hook {
        hook: HookKind,
        extension: String,
        block: Option<u64>,
        transaction: Option<u32>,
        source: anyhow::Error,
    },

    /// A shadow backend read disagreed with its primary under a failing policy.
    Validation {
        block: u64,
        transaction: Option<u32>,
        mismatch: ValidationMismatch,
    },

    /// Closing a backend handle failed and no earlier error was pending.
    Release {
        block: Option<u64>,
        source: anyhow::Error,
    },

    /// A worker thread panicked.
    WorkerPanic { worker: usize, message: String },
}

impl ReplayError {
    /// Classify a failure inside a block.
    ///
    /// Shadow mismatches become [`ReplayError::Validation`], anything else
    /// [`ReplayError::Processing`].
    pub fn processing(block: u64, transaction: Option<u32>, source: anyhow::Error) -> Self {
        if let Some(mismatch) = source.downcast_ref::<ValidationMismatch>() {
            return ReplayError::Validation {
                block,
                transaction,
                mismatch: mismatch.clone(),
            };
        }
        ReplayError::Processing {
            block,
            transaction,
            source,
        }
    }

    /// Block the failure is attributed to, if any.
    pub fn block(&self) -> Option<u64> {
        match self {
            ReplayError::Source { .. } | ReplayError::WorkerPanic { .. } => None,
            ReplayError::OutOfOrder { next, .. } => Some(next.block),
            ReplayError::Snapshot { block, .. }
            | ReplayError::Processing { block, .. }
            | ReplayError::Validation { block, .. } => Some(*block),
            ReplayError::Hook { block, .. } | ReplayError::Release { block, .. } => *block,
        }
    }
}

fn write_location(
    f: &mut fmt::Formatter<'_>,
    block: Option<u64>,
    transaction: Option<u32>,
) -> fmt::Result {
    match (block, transaction) {
        (Some(b), Some(t)) => write!(f, " at transaction {}/{}", b, t),
        (Some(b), None) => write!(f, " at block {}", b),
        _ => Ok(()),
    }
}

impl fmt::Display for ReplayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplayError::Source { source } => write!(f, "record source failed: {:#}", source),
            ReplayError::OutOfOrder { previous, next } => write!(
                f,
                "record {} arrived after {}; records must be strictly ordered by (block, transaction)",
                next, previous
            ),
            ReplayError::Snapshot { block, source } => write!(
                f,
                "cannot open archive snapshot for block {} (pre-state of block {}): {:#}",
                block.saturating_sub(1),
                block,
                source
            ),
            ReplayError::Processing {
                block,
                transaction,
                source,
            } => {
                match transaction {
                    Some(t) => write!(f, "processing of transaction {}/{} failed", block, t)?,
                    None => write!(f, "processing of block {} failed", block)?,
                }
                write!(f, ": {:#}", source)
            }
            ReplayError::Hook {
                hook,
                extension,
                block,
                transaction,
                source,
            } => {
                write!(f, "{} hook of extension {} failed", hook, extension)?;
                write_location(f, *block, *transaction)?;
                write!(f, ": {:#}", source)
            }
            ReplayError::Validation {
                block,
                transaction,
                mismatch,
            } => {
                write!(f, "validation failed")?;
                write_location(f, Some(*block), *transaction)?;
                write!(f, ": {}", mismatch)
            }
            ReplayError::Release { block, source } => {
                write!(f, "cannot close state backend")?;
                write_location(f, *block, None)?;
                write!(f, ": {:#}", source)
            }
            ReplayError::WorkerPanic { worker, message } => {
                write!(f, "replay worker {} panicked: {}", worker, message)
            }
        }
    }
}

impl std::error::Error for ReplayError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ReplayError::Source { source }
            | ReplayError::Snapshot { source, .. }
            | ReplayError::Processing { source, .. }
            | ReplayError::Hook { source, .. }
            | ReplayError::Release { source, .. } => Some(source.as_ref()),
            ReplayError::Validation { mismatch, .. } => Some(mismatch),
            ReplayError::OutOfOrder { .. } | ReplayError::WorkerPanic { .. } => None,
        }
    }
}

/// Find the [`ReplayError`] carried by an engine error, if any.
pub fn classify(err: &anyhow::Error) -> Option<&ReplayError> {
    err.downcast_ref::<ReplayError>()
}

/// Text of a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
