//! Per-run state handed to processors and extensions.

use anyhow::Result;
use crossbeam_channel::Sender;
use replay_types::TransactionRecord;
use state_backend::StateBackend;

/// Cursor of the pipeline or worker that owns it.
///
/// `payload` is set while a transaction is being handled and `None` at block
/// and run boundaries.
pub struct ExecutionState<'a, T> {
    pub block: u64,
    pub transaction: u32,
    pub payload: Option<&'a T>,
}

impl<T> Clone for ExecutionState<'_, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for ExecutionState<'_, T> {}

impl<'a, T> ExecutionState<'a, T> {
    pub fn at_block(block: u64) -> Self {
        Self {
            block,
            transaction: 0,
            payload: None,
        }
    }

    pub fn at_transaction(record: &'a TransactionRecord<T>) -> Self {
        Self {
            block: record.block,
            transaction: record.transaction,
            payload: Some(&record.payload),
        }
    }
}

impl<T> std::fmt::Debug for ExecutionState<'_, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionState")
            .field("block", &self.block)
            .field("transaction", &self.transaction)
            .field("has_payload", &self.payload.is_some())
            .finish()
    }
}

/// Handle to the backend plus auxiliary services.
///
/// The backend is exclusively borrowed by whichever pipeline or worker holds
/// the context.
pub struct RunContext<'a> {
    backend: &'a mut dyn StateBackend,
    error_sink: Option<Sender<anyhow::Error>>,
    work_units: u64,
}

impl<'a> RunContext<'a> {
    pub fn new(backend: &'a mut dyn StateBackend) -> Self {
        Self {
            backend,
            error_sink: None,
            work_units: 0,
        }
    }

    pub fn backend(&mut self) -> &mut dyn StateBackend {
        &mut *self.backend
    }

    pub fn backend_ref(&self) -> &dyn StateBackend {
        &*self.backend
    }

    /// Route non-fatal errors to `sink` instead of failing the run.
    pub fn set_error_sink(&mut self, sink: Sender<anyhow::Error>) {
        self.error_sink = Some(sink);
    }

    /// Remove the error sink, dropping the sender.
    pub fn clear_error_sink(&mut self) -> Option<Sender<anyhow::Error>> {
        self.error_sink.take()
    }

    pub fn has_error_sink(&self) -> bool {
        self.error_sink.is_some()
    }

    /// Report a transaction-level failure.
    ///
    /// With a sink installed the error is forwarded there and `Ok` is
    /// returned so the run continues. Without one (or if the sink's receiver
    /// is gone) the error is returned as fatal.
    pub fn report_error(&mut self, err: anyhow::Error) -> Result<()> {
        match &self.error_sink {
            Some(sink) => sink.send(err).map_err(|e| e.into_inner()),
            None => Err(err),
        }
    }

    /// Account `units` of work (gas) to the current transaction.
    pub fn record_work(&mut self, units: u64) {
        self.work_units = self.work_units.saturating_add(units);
    }

    pub fn work_units(&self) -> u64 {
        self.work_units
    }

    /// Return the work recorded since the last call and reset the counter.
    pub fn take_work_units(&mut self) -> u64 {
        std::mem::take(&mut self.work_units)
    }
}
