//! Transaction replay engines.
//!
//! Two engines drive a [`Processor`] over an ordered stream of
//! [`TransactionRecord`](replay_types::TransactionRecord)s:
//!
//! - [`SequentialPipeline`] - one backend, one thread, with [`Extension`]
//!   hooks around every run, block, and transaction
//! - [`ArchiveReplay`] - blocks fanned out to a worker pool, each replayed
//!   on its own archive snapshot of the previous block
//!
//! ## Sequential replay
//!
//! ```ignore
//! use replay_core::{from_fn, PipelineConfig, SequentialPipeline, VecSource};
//! use replay_core::extensions::ProgressTracker;
//!
//! let processor = from_fn(|record: &TransactionRecord<Transfer>, ctx: &mut RunContext<'_>| {
//!     apply(record, ctx.backend())
//! });
//! let mut pipeline = SequentialPipeline::new(PipelineConfig::default(), Arc::new(processor))
//!     .with_extension(ProgressTracker::default());
//! let summary = pipeline.run(&mut source, &mut backend)?;
//! ```
//!
//! ## Errors
//!
//! Both engines return `anyhow::Result`. Fatal failures carry a
//! [`ReplayError`]; use [`classify`] to inspect it.

pub mod archive;
pub mod batch;
pub mod context;
pub mod error;
pub mod extension;
pub mod extensions;
pub mod pipeline;
pub mod processor;
pub mod progress;
pub mod source;

pub use archive::{
    ArchiveConfig, ArchiveOutcome, ArchiveReplay, ArchiveSummary, CancellationToken,
};
pub use batch::{Batch, Batcher};
pub use context::{ExecutionState, RunContext};
pub use error::{classify, HookKind, ReplayError};
pub use extension::{Extension, ExtensionChain, NilExtension};
pub use pipeline::{PipelineConfig, PipelineSummary, SequentialPipeline};
pub use processor::{from_fn, FnProcessor, Processor};
pub use progress::{
    directory_size, ProgressAggregator, ProgressReport, ReportPolicy, PROGRESS_TARGET,
};
pub use source::{Consumer, PullSource, RecordIterator, RecordSource, VecIterator, VecSource};
