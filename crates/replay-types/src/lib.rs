//! Shared types for the statedb-replay workspace.
//!
//! This crate provides foundational types used across the engine and the
//! backend crates, breaking circular dependency chains.
//!
//! ## Record Types
//!
//! The [`record`] module contains the unit of replay work:
//! - [`TransactionRecord`](record::TransactionRecord) - One transaction with its opaque payload
//! - [`TxPosition`](record::TxPosition) - The `(block, transaction)` ordering key
//!
//! ## State Types
//!
//! The [`world_state`] module describes account sets used for priming and
//! archive snapshots.

pub mod address;
pub mod env_utils;
pub mod record;
pub mod world_state;

// Re-export commonly used types at crate root
pub use address::{Address, Hash};
pub use record::{TransactionRecord, TxPosition};
pub use world_state::{Account, UpdateSet, WorldState};
