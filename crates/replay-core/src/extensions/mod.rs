//! Extensions shipped with the engine.
//!
//! - [`ProgressTracker`] - periodic throughput and resource reports
//! - [`ErrorLogger`] - collects non-fatal transaction errors in
//!   continue-on-failure mode
//! - [`StatePrimer`] - loads the pre-state of the first replayed block

pub mod error_logger;
pub mod primer;
pub mod progress_tracker;

pub use error_logger::ErrorLogger;
pub use primer::StatePrimer;
pub use progress_tracker::{ProgressHistory, ProgressTracker};
