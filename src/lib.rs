//! statedb-replay
//!
//! Replays historical transactions against pluggable state backends, either
//! sequentially with extension hooks or block-parallel on archive snapshots.
//!
//! - **Engines**: [`replay_core`] - sequential pipeline, parallel archive replay
//! - **Backends**: [`state_backend`] - lifecycle contract, in-memory archive,
//!   shadow validation, priming
//! - **Types**: [`replay_types`] - addresses, records, world state
//!
//! This crate adds the run configuration ([`config`]) and a deterministic
//! synthetic workload ([`synthetic`]) used by the `replay-bench` binary.

pub mod config;
pub mod synthetic;

pub use config::ReplayConfig;

pub use replay_core;
pub use replay_types;
pub use state_backend;
