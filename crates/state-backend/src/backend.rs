//! The state backend contract consumed by the replay engine.
//!
//! A backend is a stateful handle with three nested lifecycle brackets
//! (epoch, block, transaction), account mutations that are only legal inside
//! a transaction, reads, and an optional bulk-load mode for priming.
//!
//! # Example
//!
//! ```ignore
//! use state_backend::{InMemoryBackend, StateBackend};
//!
//! let mut backend = InMemoryBackend::new();
//! backend.begin_block(1)?;
//! backend.begin_transaction(0)?;
//! backend.set_balance(&addr, 100)?;
//! backend.end_transaction()?;
//! backend.end_block()?;
//! backend.close()?;
//! ```

use anyhow::Result;
use replay_types::{Address, Hash};

/// Approximate memory footprint reported by a backend.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryUsage {
    pub used_bytes: u64,
    /// Free-form, backend-specific breakdown.
    pub breakdown: String,
}

/// A pluggable state storage engine.
///
/// Lifecycle calls must be correctly paired. Implementations fail fast on
/// misuse (see [`crate::LifecycleGuard`]).
pub trait StateBackend: Send {
    fn begin_epoch(&mut self, epoch: u64) -> Result<()>;
    fn end_epoch(&mut self) -> Result<()>;
    fn begin_block(&mut self, block: u64) -> Result<()>;
    fn end_block(&mut self) -> Result<()>;
    fn begin_transaction(&mut self, transaction: u32) -> Result<()>;
    fn end_transaction(&mut self) -> Result<()>;

    // Mutations (inside a transaction)
    fn create_account(&mut self, address: &Address) -> Result<()>;
    fn delete_account(&mut self, address: &Address) -> Result<()>;
    fn set_balance(&mut self, address: &Address, balance: u128) -> Result<()>;
    fn set_nonce(&mut self, address: &Address, nonce: u64) -> Result<()>;
    fn set_code(&mut self, address: &Address, code: &[u8]) -> Result<()>;
    fn set_state(&mut self, address: &Address, key: &Hash, value: &Hash) -> Result<()>;

    // Reads
    fn exists(&self, address: &Address) -> Result<bool>;
    fn get_balance(&self, address: &Address) -> Result<u128>;
    fn get_nonce(&self, address: &Address) -> Result<u64>;
    fn get_code(&self, address: &Address) -> Result<Vec<u8>>;
    fn get_code_hash(&self, address: &Address) -> Result<Hash>;
    fn get_state(&self, address: &Address, key: &Hash) -> Result<Hash>;

    /// Memory footprint, if the backend can estimate it.
    fn memory_usage(&self) -> Option<MemoryUsage> {
        None
    }

    /// Enter bulk-load mode. Only legal while no block is open.
    ///
    /// The loaded state becomes the state as of `block`.
    fn start_bulk_load(&mut self, block: u64) -> Result<Box<dyn BulkLoad + '_>>;

    /// Release all resources. Calling it again is a no-op.
    fn close(&mut self) -> Result<()>;
}

/// A backend that can hand out isolated views of historical state.
pub trait ArchiveBackend: StateBackend + Sync {
    /// Open a view of the state as of immediately after `block`.
    ///
    /// Must be safe to call concurrently for different blocks. The returned
    /// handle is exclusively owned by the caller and mutations on it never
    /// reach the archive.
    fn open_archive_snapshot(&self, block: u64) -> Result<Box<dyn StateBackend>>;
}

/// Bulk-load session used to initialise a backend outside of transactions.
///
/// Implementations may commit implicitly every N operations; `close`
/// performs the final commit.
pub trait BulkLoad {
    fn create_account(&mut self, address: &Address) -> Result<()>;
    fn set_balance(&mut self, address: &Address, balance: u128) -> Result<()>;
    fn set_nonce(&mut self, address: &Address, nonce: u64) -> Result<()>;
    fn set_code(&mut self, address: &Address, code: &[u8]) -> Result<()>;
    fn set_state(&mut self, address: &Address, key: &Hash, value: &Hash) -> Result<()>;
    fn close(self: Box<Self>) -> Result<()>;
}

impl<B: StateBackend + ?Sized> StateBackend for Box<B> {
    fn begin_epoch(&mut self, epoch: u64) -> Result<()> {
        (**self).begin_epoch(epoch)
    }

    fn end_epoch(&mut self) -> Result<()> {
        (**self).end_epoch()
    }

    fn begin_block(&mut self, block: u64) -> Result<()> {
        (**self).begin_block(block)
    }

    fn end_block(&mut self) -> Result<()> {
        (**self).end_block()
    }

    fn begin_transaction(&mut self, transaction: u32) -> Result<()> {
        (**self).begin_transaction(transaction)
    }

    fn end_transaction(&mut self) -> Result<()> {
        (**self).end_transaction()
    }

    fn create_account(&mut self, address: &Address) -> Result<()> {
        (**self).create_account(address)
    }

    fn delete_account(&mut self, address: &Address) -> Result<()> {
        (**self).delete_account(address)
    }

    fn set_balance(&mut self, address: &Address, balance: u128) -> Result<()> {
        (**self).set_balance(address, balance)
    }

    fn set_nonce(&mut self, address: &Address, nonce: u64) -> Result<()> {
        (**self).set_nonce(address, nonce)
    }

    fn set_code(&mut self, address: &Address, code: &[u8]) -> Result<()> {
        (**self).set_code(address, code)
    }

    fn set_state(&mut self, address: &Address, key: &Hash, value: &Hash) -> Result<()> {
        (**self).set_state(address, key, value)
    }

    fn exists(&self, address: &Address) -> Result<bool> {
        (**self).exists(address)
    }

    fn get_balance(&self, address: &Address) -> Result<u128> {
        (**self).get_balance(address)
    }

    fn get_nonce(&self, address: &Address) -> Result<u64> {
        (**self).get_nonce(address)
    }

    fn get_code(&self, address: &Address) -> Result<Vec<u8>> {
        (**self).get_code(address)
    }

    fn get_code_hash(&self, address: &Address) -> Result<Hash> {
        (**self).get_code_hash(address)
    }

    fn get_state(&self, address: &Address, key: &Hash) -> Result<Hash> {
        (**self).get_state(address, key)
    }

    fn memory_usage(&self) -> Option<MemoryUsage> {
        (**self).memory_usage()
    }

    fn start_bulk_load(&mut self, block: u64) -> Result<Box<dyn BulkLoad + '_>> {
        (**self).start_bulk_load(block)
    }

    fn close(&mut self) -> Result<()> {
        (**self).close()
    }
}
