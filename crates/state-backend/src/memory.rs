//! Reference in-memory backend with an optional block archive.
//!
//! State is held behind an `Arc<WorldState>` and mutated copy-on-write, so
//! archiving a block is a pointer clone and archive snapshots are fully
//! isolated from the live state and from each other.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use replay_types::{Account, Address, Hash, WorldState};
use tracing::debug;

use crate::backend::{ArchiveBackend, BulkLoad, MemoryUsage, StateBackend};
use crate::code_cache::CodeHashCache;
use crate::lifecycle::LifecycleGuard;

/// Operations per implicit bulk-load commit.
pub const DEFAULT_BULK_COMMIT_OPS: u64 = 1_000_000;

/// An in-memory [`StateBackend`].
#[derive(Debug)]
pub struct InMemoryBackend {
    state: Arc<WorldState>,
    archive: Option<BTreeMap<u64, Arc<WorldState>>>,
    guard: LifecycleGuard,
    code_cache: Arc<CodeHashCache>,
    bulk_commit_ops: u64,
    bulk_commits: u64,
    last_committed_block: Option<u64>,
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBackend {
    /// A backend without an archive.
    pub fn new() -> Self {
        Self {
            state: Arc::new(WorldState::new()),
            archive: None,
            guard: LifecycleGuard::new(),
            code_cache: Arc::new(CodeHashCache::new()),
            bulk_commit_ops: DEFAULT_BULK_COMMIT_OPS,
            bulk_commits: 0,
            last_committed_block: None,
        }
    }

    /// Start from an existing world state, committed as of `block`.
    pub fn from_world_state(state: WorldState, block: u64) -> Self {
        Self {
            state: Arc::new(state),
            last_committed_block: Some(block),
            ..Self::new()
        }
    }

    /// Record the state at every block commit so it can be snapshotted.
    pub fn with_archive(mut self) -> Self {
        let mut archive = BTreeMap::new();
        if let Some(block) = self.last_committed_block {
            archive.insert(block, Arc::clone(&self.state));
        }
        self.archive = Some(archive);
        self
    }

    pub fn with_code_cache(mut self, cache: Arc<CodeHashCache>) -> Self {
        self.code_cache = cache;
        self
    }

    pub fn with_bulk_commit_ops(mut self, ops: u64) -> Self {
        self.bulk_commit_ops = ops.max(1);
        self
    }

    pub fn world_state(&self) -> &WorldState {
        &self.state
    }

    pub fn code_cache(&self) -> &Arc<CodeHashCache> {
        &self.code_cache
    }

    /// Blocks for which an archived state exists, ascending.
    pub fn archived_blocks(&self) -> Vec<u64> {
        self.archive
            .as_ref()
            .map(|archive| archive.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn last_committed_block(&self) -> Option<u64> {
        self.last_committed_block
    }

    /// Number of commits performed by bulk loads so far.
    pub fn bulk_commits(&self) -> u64 {
        self.bulk_commits
    }

    pub fn is_closed(&self) -> bool {
        self.guard.is_closed()
    }

    /// A fresh, open handle over the committed state and archive.
    ///
    /// Works on closed backends, so a history written by one run can be
    /// replayed by the next.
    pub fn reopen(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
            archive: self.archive.clone(),
            guard: LifecycleGuard::new(),
            code_cache: Arc::clone(&self.code_cache),
            bulk_commit_ops: self.bulk_commit_ops,
            bulk_commits: 0,
            last_committed_block: self.last_committed_block,
        }
    }

    fn commit(&mut self, block: u64) {
        if let Some(archive) = self.archive.as_mut() {
            archive.insert(block, Arc::clone(&self.state));
        }
        self.last_committed_block = Some(self.last_committed_block.map_or(block, |b| b.max(block)));
    }

    fn account_mut(&mut self, address: &Address) -> &mut Account {
        Arc::make_mut(&mut self.state).entry(*address)
    }

    fn read<R>(
        &self,
        operation: &'static str,
        address: &Address,
        f: impl FnOnce(&Account) -> R,
        default: R,
    ) -> Result<R> {
        self.guard.ensure_open(operation)?;
        Ok(self.state.get(address).map(f).unwrap_or(default))
    }
}

impl StateBackend for InMemoryBackend {
    fn begin_epoch(&mut self, epoch: u64) -> Result<()> {
        self.guard.begin_epoch(epoch)?;
        Ok(())
    }

    fn end_epoch(&mut self) -> Result<()> {
        self.guard.end_epoch()?;
        Ok(())
    }

    fn begin_block(&mut self, block: u64) -> Result<()> {
        self.guard.begin_block(block)?;
        Ok(())
    }

    fn end_block(&mut self) -> Result<()> {
        let block = self.guard.end_block()?;
        self.commit(block);
        Ok(())
    }

    fn begin_transaction(&mut self, transaction: u32) -> Result<()> {
        self.guard.begin_transaction(transaction)?;
        Ok(())
    }

    fn end_transaction(&mut self) -> Result<()> {
        self.guard.end_transaction()?;
        Ok(())
    }

    fn create_account(&mut self, address: &Address) -> Result<()> {
        self.guard.require_transaction("create_account")?;
        self.account_mut(address);
        Ok(())
    }

    fn delete_account(&mut self, address: &Address) -> Result<()> {
        self.guard.require_transaction("delete_account")?;
        if self.state.contains(address) {
            Arc::make_mut(&mut self.state).remove(address);
        }
        Ok(())
    }

    fn set_balance(&mut self, address: &Address, balance: u128) -> Result<()> {
        self.guard.require_transaction("set_balance")?;
        self.account_mut(address).balance = balance;
        Ok(())
    }

    fn set_nonce(&mut self, address: &Address, nonce: u64) -> Result<()> {
        self.guard.require_transaction("set_nonce")?;
        self.account_mut(address).nonce = nonce;
        Ok(())
    }

    fn set_code(&mut self, address: &Address, code: &[u8]) -> Result<()> {
        self.guard.require_transaction("set_code")?;
        self.account_mut(address).code = code.to_vec();
        Ok(())
    }

    fn set_state(&mut self, address: &Address, key: &Hash, value: &Hash) -> Result<()> {
        self.guard.require_transaction("set_state")?;
        self.account_mut(address).storage.insert(*key, *value);
        Ok(())
    }

    fn exists(&self, address: &Address) -> Result<bool> {
        self.guard.ensure_open("exists")?;
        Ok(self.state.contains(address))
    }

    fn get_balance(&self, address: &Address) -> Result<u128> {
        self.read("get_balance", address, |a| a.balance, 0)
    }

    fn get_nonce(&self, address: &Address) -> Result<u64> {
        self.read("get_nonce", address, |a| a.nonce, 0)
    }

    fn get_code(&self, address: &Address) -> Result<Vec<u8>> {
        self.read("get_code", address, |a| a.code.clone(), Vec::new())
    }

    fn get_code_hash(&self, address: &Address) -> Result<Hash> {
        self.guard.ensure_open("get_code_hash")?;
        Ok(match self.state.get(address) {
            Some(account) => self.code_cache.code_hash(address, &account.code),
            None => Hash::ZERO,
        })
    }

    fn get_state(&self, address: &Address, key: &Hash) -> Result<Hash> {
        self.read(
            "get_state",
            address,
            |a| a.storage.get(key).copied().unwrap_or(Hash::ZERO),
            Hash::ZERO,
        )
    }

    fn memory_usage(&self) -> Option<MemoryUsage> {
        let live = self.state.estimate_size();
        let archived = self.archive.as_ref().map_or(0, |a| a.len());
        Some(MemoryUsage {
            used_bytes: live,
            breakdown: format!(
                "live state: {} accounts, {} bytes; archived blocks: {}; code cache entries: {}",
                self.state.len(),
                live,
                archived,
                self.code_cache.len()
            ),
        })
    }

    fn start_bulk_load(&mut self, block: u64) -> Result<Box<dyn BulkLoad + '_>> {
        self.guard.require_idle("start_bulk_load")?;
        debug!(block, "starting in-memory bulk load");
        Ok(Box::new(InMemoryBulkLoad {
            backend: self,
            block,
            pending_ops: 0,
        }))
    }

    fn close(&mut self) -> Result<()> {
        if !self.guard.close() {
            debug!("in-memory backend already closed");
        }
        Ok(())
    }
}

impl ArchiveBackend for InMemoryBackend {
    fn open_archive_snapshot(&self, block: u64) -> Result<Box<dyn StateBackend>> {
        self.guard.ensure_open("open_archive_snapshot")?;
        let archive = self
            .archive
            .as_ref()
            .ok_or_else(|| anyhow!("archive mode is not enabled on this backend"))?;
        match self.last_committed_block {
            Some(last) if block <= last => {}
            Some(last) => {
                return Err(anyhow!(
                    "block {} is beyond the last committed block {}",
                    block,
                    last
                ))
            }
            None => return Err(anyhow!("no block has been committed yet")),
        }
        // Blocks without transactions leave no archive entry; their state is
        // that of the closest earlier block.
        let (_, state) = archive
            .range(..=block)
            .next_back()
            .ok_or_else(|| anyhow!("no archived state at or before block {}", block))?;
        Ok(Box::new(InMemoryBackend {
            state: Arc::clone(state),
            archive: None,
            guard: LifecycleGuard::new(),
            code_cache: Arc::clone(&self.code_cache),
            bulk_commit_ops: self.bulk_commit_ops,
            bulk_commits: 0,
            last_committed_block: Some(block),
        }))
    }
}

struct InMemoryBulkLoad<'a> {
    backend: &'a mut InMemoryBackend,
    block: u64,
    pending_ops: u64,
}

impl InMemoryBulkLoad<'_> {
    fn tick(&mut self) {
        self.pending_ops += 1;
        if self.pending_ops >= self.backend.bulk_commit_ops {
            self.flush();
        }
    }

    fn flush(&mut self) {
        debug!(block = self.block, ops = self.pending_ops, "committing bulk load chunk");
        self.backend.commit(self.block);
        self.backend.bulk_commits += 1;
        self.pending_ops = 0;
    }
}

impl BulkLoad for InMemoryBulkLoad<'_> {
    fn create_account(&mut self, address: &Address) -> Result<()> {
        self.backend.account_mut(address);
        self.tick();
        Ok(())
    }

    fn set_balance(&mut self, address: &Address, balance: u128) -> Result<()> {
        self.backend.account_mut(address).balance = balance;
        self.tick();
        Ok(())
    }

    fn set_nonce(&mut self, address: &Address, nonce: u64) -> Result<()> {
        self.backend.account_mut(address).nonce = nonce;
        self.tick();
        Ok(())
    }

    fn set_code(&mut self, address: &Address, code: &[u8]) -> Result<()> {
        self.backend.account_mut(address).code = code.to_vec();
        self.tick();
        Ok(())
    }

    fn set_state(&mut self, address: &Address, key: &Hash, value: &Hash) -> Result<()> {
        self.backend.account_mut(address).storage.insert(*key, *value);
        self.tick();
        Ok(())
    }

    fn close(mut self: Box<Self>) -> Result<()> {
        if self.pending_ops > 0 || self.backend.last_committed_block.is_none() {
            self.flush();
        }
        Ok(())
    }
}
