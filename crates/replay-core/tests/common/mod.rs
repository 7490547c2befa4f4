#![allow(dead_code)]
//! Recording fakes shared by the integration tests.
//!
//! Every fake appends to one [`Trace`] so tests can assert the exact
//! interleaving of backend calls, extension hooks, and processing.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use parking_lot::Mutex;
use replay_core::{from_fn, ExecutionState, Extension, Processor, RunContext};
use replay_types::{Address, Hash, TransactionRecord};
use state_backend::{BulkLoad, InMemoryBackend, StateBackend};

pub type Trace = Arc<Mutex<Vec<String>>>;

pub fn new_trace() -> Trace {
    Arc::new(Mutex::new(Vec::new()))
}

pub fn entries(trace: &Trace) -> Vec<String> {
    trace.lock().clone()
}

pub fn records(positions: &[(u64, u32)]) -> Vec<TransactionRecord<()>> {
    positions
        .iter()
        .map(|(b, t)| TransactionRecord::new(*b, *t, ()))
        .collect()
}

/// In-memory backend that traces its lifecycle calls and can be told to fail
/// on one of them.
pub struct RecordingBackend {
    inner: InMemoryBackend,
    trace: Trace,
    fail_on: Option<String>,
}

impl RecordingBackend {
    pub fn new(trace: Trace) -> Self {
        Self {
            inner: InMemoryBackend::new(),
            trace,
            fail_on: None,
        }
    }

    pub fn failing_on(mut self, event: &str) -> Self {
        self.fail_on = Some(event.to_string());
        self
    }

    fn record(&self, event: String) -> Result<()> {
        let fail = self.fail_on.as_deref() == Some(event.as_str());
        self.trace.lock().push(event.clone());
        if fail {
            return Err(anyhow!("injected backend failure in {}", event));
        }
        Ok(())
    }
}

impl StateBackend for RecordingBackend {
    fn begin_epoch(&mut self, epoch: u64) -> Result<()> {
        self.record(format!("BeginEpoch({})", epoch))?;
        self.inner.begin_epoch(epoch)
    }

    fn end_epoch(&mut self) -> Result<()> {
        self.record("EndEpoch".into())?;
        self.inner.end_epoch()
    }

    fn begin_block(&mut self, block: u64) -> Result<()> {
        self.record(format!("BeginBlock({})", block))?;
        self.inner.begin_block(block)
    }

    fn end_block(&mut self) -> Result<()> {
        self.record("EndBlock".into())?;
        self.inner.end_block()
    }

    fn begin_transaction(&mut self, transaction: u32) -> Result<()> {
        self.record(format!("BeginTx({})", transaction))?;
        self.inner.begin_transaction(transaction)
    }

    fn end_transaction(&mut self) -> Result<()> {
        self.record("EndTx".into())?;
        self.inner.end_transaction()
    }

    fn create_account(&mut self, address: &Address) -> Result<()> {
        self.inner.create_account(address)
    }

    fn delete_account(&mut self, address: &Address) -> Result<()> {
        self.inner.delete_account(address)
    }

    fn set_balance(&mut self, address: &Address, balance: u128) -> Result<()> {
        self.inner.set_balance(address, balance)
    }

    fn set_nonce(&mut self, address: &Address, nonce: u64) -> Result<()> {
        self.inner.set_nonce(address, nonce)
    }

    fn set_code(&mut self, address: &Address, code: &[u8]) -> Result<()> {
        self.inner.set_code(address, code)
    }

    fn set_state(&mut self, address: &Address, key: &Hash, value: &Hash) -> Result<()> {
        self.inner.set_state(address, key, value)
    }

    fn exists(&self, address: &Address) -> Result<bool> {
        self.inner.exists(address)
    }

    fn get_balance(&self, address: &Address) -> Result<u128> {
        self.inner.get_balance(address)
    }

    fn get_nonce(&self, address: &Address) -> Result<u64> {
        self.inner.get_nonce(address)
    }

    fn get_code(&self, address: &Address) -> Result<Vec<u8>> {
        self.inner.get_code(address)
    }

    fn get_code_hash(&self, address: &Address) -> Result<Hash> {
        self.inner.get_code_hash(address)
    }

    fn get_state(&self, address: &Address, key: &Hash) -> Result<Hash> {
        self.inner.get_state(address, key)
    }

    fn start_bulk_load(&mut self, block: u64) -> Result<Box<dyn BulkLoad + '_>> {
        self.inner.start_bulk_load(block)
    }

    fn close(&mut self) -> Result<()> {
        self.record("Close".into())?;
        self.inner.close()
    }
}

/// Extension that traces every hook, tagged with its name.
pub struct RecordingExtension {
    name: String,
    trace: Trace,
    fail_on: Option<String>,
}

impl RecordingExtension {
    pub fn new(name: &str, trace: Trace) -> Self {
        Self {
            name: name.to_string(),
            trace,
            fail_on: None,
        }
    }

    pub fn failing_on(mut self, event: &str) -> Self {
        self.fail_on = Some(event.to_string());
        self
    }

    fn record(&self, event: String) -> Result<()> {
        let fail = self.fail_on.as_deref() == Some(event.as_str());
        self.trace.lock().push(format!("{}:{}", self.name, event));
        if fail {
            return Err(anyhow!("{} refused {}", self.name, event));
        }
        Ok(())
    }
}

impl Extension<()> for RecordingExtension {
    fn pre_run(&mut self, _: ExecutionState<'_, ()>, _: &mut RunContext<'_>) -> Result<()> {
        self.record("PreRun".into())
    }

    fn post_run(
        &mut self,
        _: ExecutionState<'_, ()>,
        _: &mut RunContext<'_>,
        err: Option<&anyhow::Error>,
    ) -> Result<()> {
        let outcome = if err.is_some() { "err" } else { "nil" };
        self.record(format!("PostRun({})", outcome))
    }

    fn pre_block(&mut self, state: ExecutionState<'_, ()>, _: &mut RunContext<'_>) -> Result<()> {
        self.record(format!("PreBlock({})", state.block))
    }

    fn post_block(&mut self, state: ExecutionState<'_, ()>, _: &mut RunContext<'_>) -> Result<()> {
        self.record(format!("PostBlock({})", state.block))
    }

    fn pre_transaction(
        &mut self,
        state: ExecutionState<'_, ()>,
        _: &mut RunContext<'_>,
    ) -> Result<()> {
        self.record(format!("PreTx({},{})", state.block, state.transaction))
    }

    fn post_transaction(
        &mut self,
        state: ExecutionState<'_, ()>,
        _: &mut RunContext<'_>,
    ) -> Result<()> {
        self.record(format!("PostTx({},{})", state.block, state.transaction))
    }

    fn name(&self) -> String {
        self.name.clone()
    }
}

/// Processor that traces `Process(b,t)` and optionally fails on one record.
pub fn recording_processor(trace: Trace, fail_at: Option<(u64, u32)>) -> impl Processor<()> {
    from_fn(move |record: &TransactionRecord<()>, _: &mut RunContext<'_>| {
        trace
            .lock()
            .push(format!("Process({},{})", record.block, record.transaction));
        if fail_at == Some((record.block, record.transaction)) {
            return Err(anyhow!("injected processing failure"));
        }
        Ok(())
    })
}
