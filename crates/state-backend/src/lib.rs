//! State backend contract and reference implementations.
//!
//! The replay engine drives backends exclusively through the traits in
//! [`backend`]:
//!
//! - [`StateBackend`] - lifecycle brackets, account mutation and reads, bulk load
//! - [`ArchiveBackend`] - isolated historical snapshots for parallel replay
//! - [`BulkLoad`] - priming outside of transaction brackets
//!
//! ## Implementations
//!
//! - [`InMemoryBackend`] - reference backend with an optional block archive
//! - [`ShadowBackend`] - runs two backends side by side and diffs every read
//! - [`LoggingBackend`] - traces every call at `debug` level
//!
//! ## Supporting pieces
//!
//! - [`LifecycleGuard`] - fail-fast bracket bookkeeping used by implementations
//! - [`CodeHashCache`] - code hash memoization shared across snapshot handles
//! - [`Primer`] - loads update sets into a backend before replay starts

pub mod backend;
pub mod code_cache;
pub mod lifecycle;
pub mod logging;
pub mod memory;
pub mod primer;
pub mod shadow;

pub use backend::{ArchiveBackend, BulkLoad, MemoryUsage, StateBackend};
pub use code_cache::{CodeCacheStats, CodeHashCache};
pub use lifecycle::{Bracket, LifecycleError, LifecycleGuard};
pub use logging::{HandleCounter, LoggingBackend};
pub use memory::{InMemoryBackend, DEFAULT_BULK_COMMIT_OPS};
pub use primer::{PrimeConfig, PrimeStats, Primer};
pub use shadow::{MismatchPolicy, ShadowBackend, ValidationLog, ValidationMismatch};
