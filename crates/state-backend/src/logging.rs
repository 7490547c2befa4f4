//! Decorator that traces every backend call at `debug` level.
//!
//! Snapshots opened through a [`LoggingBackend`] are wrapped as well and
//! counted in a [`HandleCounter`] shared with the parent, so leaked snapshot
//! handles show up both in the log and in the counts.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use replay_types::{Address, Hash};
use tracing::{debug, warn};

use crate::backend::{ArchiveBackend, BulkLoad, MemoryUsage, StateBackend};

/// Archive snapshots opened and closed through one logging backend.
#[derive(Debug, Default)]
pub struct HandleCounter {
    opened: AtomicU64,
    closed: AtomicU64,
}

impl HandleCounter {
    pub fn opened(&self) -> u64 {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> u64 {
        self.closed.load(Ordering::SeqCst)
    }

    /// Snapshots opened but not yet closed.
    pub fn open_handles(&self) -> u64 {
        self.opened().saturating_sub(self.closed())
    }
}

/// Accounting of one open snapshot handle.
struct SnapshotLease {
    name: String,
    handles: Arc<HandleCounter>,
    released: bool,
}

impl SnapshotLease {
    fn open(name: String, handles: Arc<HandleCounter>) -> Self {
        handles.opened.fetch_add(1, Ordering::SeqCst);
        Self {
            name,
            handles,
            released: false,
        }
    }

    fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.handles.closed.fetch_add(1, Ordering::SeqCst);
        }
    }
}

impl Drop for SnapshotLease {
    fn drop(&mut self) {
        if !self.released {
            warn!(backend = %self.name, "snapshot handle dropped without close");
        }
    }
}

/// Wraps a backend and logs each call with its arguments and result.
pub struct LoggingBackend<B> {
    inner: B,
    name: String,
    handles: Arc<HandleCounter>,
    /// Set on snapshots opened through a parent.
    lease: Option<SnapshotLease>,
}

impl<B: StateBackend> LoggingBackend<B> {
    pub fn new(inner: B, name: impl Into<String>) -> Self {
        Self {
            inner,
            name: name.into(),
            handles: Arc::new(HandleCounter::default()),
            lease: None,
        }
    }

    /// Counts of snapshots opened through this backend.
    pub fn handles(&self) -> Arc<HandleCounter> {
        Arc::clone(&self.handles)
    }

    pub fn inner(&self) -> &B {
        &self.inner
    }

    pub fn into_inner(self) -> B {
        self.inner
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl<B: StateBackend> StateBackend for LoggingBackend<B> {
    fn begin_epoch(&mut self, epoch: u64) -> Result<()> {
        debug!(backend = %self.name, epoch, "begin_epoch");
        self.inner.begin_epoch(epoch)
    }

    fn end_epoch(&mut self) -> Result<()> {
        debug!(backend = %self.name, "end_epoch");
        self.inner.end_epoch()
    }

    fn begin_block(&mut self, block: u64) -> Result<()> {
        debug!(backend = %self.name, block, "begin_block");
        self.inner.begin_block(block)
    }

    fn end_block(&mut self) -> Result<()> {
        debug!(backend = %self.name, "end_block");
        self.inner.end_block()
    }

    fn begin_transaction(&mut self, transaction: u32) -> Result<()> {
        debug!(backend = %self.name, transaction, "begin_transaction");
        self.inner.begin_transaction(transaction)
    }

    fn end_transaction(&mut self) -> Result<()> {
        debug!(backend = %self.name, "end_transaction");
        self.inner.end_transaction()
    }

    fn create_account(&mut self, address: &Address) -> Result<()> {
        debug!(backend = %self.name, %address, "create_account");
        self.inner.create_account(address)
    }

    fn delete_account(&mut self, address: &Address) -> Result<()> {
        debug!(backend = %self.name, %address, "delete_account");
        self.inner.delete_account(address)
    }

    fn set_balance(&mut self, address: &Address, balance: u128) -> Result<()> {
        debug!(backend = %self.name, %address, balance = %balance, "set_balance");
        self.inner.set_balance(address, balance)
    }

    fn set_nonce(&mut self, address: &Address, nonce: u64) -> Result<()> {
        debug!(backend = %self.name, %address, nonce, "set_nonce");
        self.inner.set_nonce(address, nonce)
    }

    fn set_code(&mut self, address: &Address, code: &[u8]) -> Result<()> {
        debug!(backend = %self.name, %address, code_len = code.len(), "set_code");
        self.inner.set_code(address, code)
    }

    fn set_state(&mut self, address: &Address, key: &Hash, value: &Hash) -> Result<()> {
        debug!(backend = %self.name, %address, %key, %value, "set_state");
        self.inner.set_state(address, key, value)
    }

    fn exists(&self, address: &Address) -> Result<bool> {
        let result = self.inner.exists(address);
        debug!(backend = %self.name, %address, result = ?result.as_ref().ok(), "exists");
        result
    }

    fn get_balance(&self, address: &Address) -> Result<u128> {
        let result = self.inner.get_balance(address);
        debug!(backend = %self.name, %address, result = ?result.as_ref().ok(), "get_balance");
        result
    }

    fn get_nonce(&self, address: &Address) -> Result<u64> {
        let result = self.inner.get_nonce(address);
        debug!(backend = %self.name, %address, result = ?result.as_ref().ok(), "get_nonce");
        result
    }

    fn get_code(&self, address: &Address) -> Result<Vec<u8>> {
        let result = self.inner.get_code(address);
        debug!(
            backend = %self.name,
            %address,
            code_len = ?result.as_ref().ok().map(Vec::len),
            "get_code"
        );
        result
    }

    fn get_code_hash(&self, address: &Address) -> Result<Hash> {
        let result = self.inner.get_code_hash(address);
        debug!(backend = %self.name, %address, result = ?result.as_ref().ok(), "get_code_hash");
        result
    }

    fn get_state(&self, address: &Address, key: &Hash) -> Result<Hash> {
        let result = self.inner.get_state(address, key);
        debug!(backend = %self.name, %address, %key, result = ?result.as_ref().ok(), "get_state");
        result
    }

    fn memory_usage(&self) -> Option<MemoryUsage> {
        self.inner.memory_usage()
    }

    fn start_bulk_load(&mut self, block: u64) -> Result<Box<dyn BulkLoad + '_>> {
        debug!(backend = %self.name, block, "start_bulk_load");
        self.inner.start_bulk_load(block)
    }

    fn close(&mut self) -> Result<()> {
        debug!(backend = %self.name, "close");
        let result = self.inner.close();
        if let Some(lease) = self.lease.as_mut() {
            lease.release();
        }
        result
    }
}

impl<B: ArchiveBackend> ArchiveBackend for LoggingBackend<B> {
    fn open_archive_snapshot(&self, block: u64) -> Result<Box<dyn StateBackend>> {
        debug!(backend = %self.name, block, "open_archive_snapshot");
        let snapshot = self.inner.open_archive_snapshot(block)?;
        let name = format!("{}@{}", self.name, block);
        Ok(Box::new(LoggingBackend {
            inner: snapshot,
            lease: Some(SnapshotLease::open(name.clone(), Arc::clone(&self.handles))),
            name,
            handles: Arc::clone(&self.handles),
        }))
    }
}
