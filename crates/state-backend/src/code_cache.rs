//! Memoized code hashing shared between backend handles.
//!
//! Hashing contract code is the one piece of work every worker repeats for the
//! same accounts, so the cache is the only state the parallel engine mutates
//! from several threads at once. It is an explicit object: construct one per
//! run, hand it out via `Arc`, drop it when the run ends.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use replay_types::{Address, Hash};
use sha2::{Digest, Sha256};

/// Hit/miss counters of a [`CodeHashCache`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CodeCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

/// Lock-guarded `(address, code) -> hash` memoization table.
#[derive(Debug, Default)]
pub struct CodeHashCache {
    entries: Mutex<HashMap<(Address, Vec<u8>), Hash>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CodeHashCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// SHA-256 of `code`, memoized per address.
    pub fn code_hash(&self, address: &Address, code: &[u8]) -> Hash {
        let key = (*address, code.to_vec());
        if let Some(hash) = self.entries.lock().get(&key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return *hash;
        }

        // Hash outside the lock; a concurrent miss for the same key computes
        // the same value.
        let hash = hash_code(code);
        self.misses.fetch_add(1, Ordering::Relaxed);
        self.entries.lock().insert(key, hash);
        hash
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Drop all entries and reset the counters.
    pub fn clear(&self) {
        self.entries.lock().clear();
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
    }

    pub fn stats(&self) -> CodeCacheStats {
        CodeCacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.len(),
        }
    }
}

/// Uncached SHA-256 of a code blob.
pub fn hash_code(code: &[u8]) -> Hash {
    let digest = Sha256::digest(code);
    let mut bytes = [0u8; 32];
    bytes.copy_from_slice(&digest);
    Hash(bytes)
}
