//! Dual-backend decorator for validating one backend against another.
//!
//! [`ShadowBackend`] owns a primary and a shadow backend and presents them as
//! one. Every lifecycle call and mutation goes to both; every read goes to
//! both and the results are compared. Reads always return the primary's value.
//!
//! Mismatches are recorded in a [`ValidationLog`] shared with the caller. Under
//! [`MismatchPolicy::Report`] replay continues; under [`MismatchPolicy::Fail`]
//! the read fails with the [`ValidationMismatch`] as its error.
//!
//! # Example
//!
//! ```ignore
//! let log = ValidationLog::new();
//! let backend = ShadowBackend::new(reference, candidate)
//!     .with_log(log.clone())
//!     .with_policy(MismatchPolicy::Report);
//! // ... replay ...
//! assert!(log.is_empty(), "{} mismatches", log.len());
//! ```

use std::fmt;
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use replay_types::{Address, Hash};
use tracing::warn;

use crate::backend::{ArchiveBackend, BulkLoad, MemoryUsage, StateBackend};

/// What to do when the two backends disagree on a read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MismatchPolicy {
    /// Record and log the mismatch, return the primary's value.
    #[default]
    Report,
    /// Record the mismatch and fail the read.
    Fail,
}

/// A read on which the primary and shadow backends disagreed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationMismatch {
    pub call: &'static str,
    pub address: Address,
    /// Storage key, for `get_state`.
    pub key: Option<Hash>,
    pub primary: String,
    pub shadow: String,
    /// Block open at the time of the read, if any.
    pub block: Option<u64>,
}

impl fmt::Display for ValidationMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "shadow mismatch in {}({}", self.call, self.address)?;
        if let Some(key) = &self.key {
            write!(f, ", {}", key)?;
        }
        write!(f, "): primary {}, shadow {}", self.primary, self.shadow)?;
        if let Some(block) = self.block {
            write!(f, " at block {}", block)?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationMismatch {}

/// Shared, cloneable record of validation mismatches.
#[derive(Debug, Clone, Default)]
pub struct ValidationLog {
    inner: Arc<Mutex<Vec<ValidationMismatch>>>,
}

impl ValidationLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, mismatch: ValidationMismatch) {
        self.inner.lock().push(mismatch);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Copy of all mismatches recorded so far.
    pub fn mismatches(&self) -> Vec<ValidationMismatch> {
        self.inner.lock().clone()
    }

    pub fn clear(&self) {
        self.inner.lock().clear();
    }
}

/// Rendering of read results for mismatch reports.
trait Render {
    fn render(&self) -> String;
}

impl Render for bool {
    fn render(&self) -> String {
        self.to_string()
    }
}

impl Render for u64 {
    fn render(&self) -> String {
        self.to_string()
    }
}

impl Render for u128 {
    fn render(&self) -> String {
        self.to_string()
    }
}

impl Render for Hash {
    fn render(&self) -> String {
        self.to_hex_literal()
    }
}

impl Render for Vec<u8> {
    fn render(&self) -> String {
        format!("0x{} ({} bytes)", hex_prefix(self), self.len())
    }
}

fn hex_prefix(bytes: &[u8]) -> String {
    const MAX: usize = 16;
    let shown: String = bytes.iter().take(MAX).map(|b| format!("{:02x}", b)).collect();
    if bytes.len() > MAX {
        format!("{}..", shown)
    } else {
        shown
    }
}

/// Combine the outcomes of a call applied to both backends.
///
/// Both calls have already been attempted; the primary's error wins.
fn merge(call: &'static str, primary: Result<()>, shadow: Result<()>) -> Result<()> {
    match (primary, shadow) {
        (Ok(()), Ok(())) => Ok(()),
        (Err(e), Ok(())) => Err(e.context(format!("primary backend failed in {}", call))),
        (Ok(()), Err(e)) => Err(e.context(format!("shadow backend failed in {}", call))),
        (Err(p), Err(s)) => {
            warn!(call, error = %s, "shadow backend also failed");
            Err(p.context(format!("primary backend failed in {}", call)))
        }
    }
}

/// A backend that mirrors every call onto a second backend.
pub struct ShadowBackend<P, S> {
    primary: P,
    shadow: S,
    log: ValidationLog,
    policy: MismatchPolicy,
    block: Option<u64>,
}

impl<P: StateBackend, S: StateBackend> ShadowBackend<P, S> {
    pub fn new(primary: P, shadow: S) -> Self {
        Self {
            primary,
            shadow,
            log: ValidationLog::new(),
            policy: MismatchPolicy::default(),
            block: None,
        }
    }

    pub fn with_log(mut self, log: ValidationLog) -> Self {
        self.log = log;
        self
    }

    pub fn with_policy(mut self, policy: MismatchPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn log(&self) -> &ValidationLog {
        &self.log
    }

    pub fn primary(&self) -> &P {
        &self.primary
    }

    pub fn shadow(&self) -> &S {
        &self.shadow
    }

    pub fn into_inner(self) -> (P, S) {
        (self.primary, self.shadow)
    }

    fn compare<V: PartialEq + Render>(
        &self,
        call: &'static str,
        address: &Address,
        key: Option<Hash>,
        primary: Result<V>,
        shadow: Result<V>,
    ) -> Result<V> {
        let primary = primary.with_context(|| format!("primary backend failed in {}", call))?;
        let shadow = shadow.with_context(|| format!("shadow backend failed in {}", call))?;
        if primary == shadow {
            return Ok(primary);
        }

        let mismatch = ValidationMismatch {
            call,
            address: *address,
            key,
            primary: primary.render(),
            shadow: shadow.render(),
            block: self.block,
        };
        warn!(
            call,
            address = %mismatch.address,
            block = ?mismatch.block,
            primary = %mismatch.primary,
            shadow = %mismatch.shadow,
            "shadow backend mismatch"
        );
        self.log.record(mismatch.clone());
        match self.policy {
            MismatchPolicy::Report => Ok(primary),
            MismatchPolicy::Fail => Err(mismatch.into()),
        }
    }
}

impl<P: StateBackend, S: StateBackend> StateBackend for ShadowBackend<P, S> {
    fn begin_epoch(&mut self, epoch: u64) -> Result<()> {
        let p = self.primary.begin_epoch(epoch);
        let s = self.shadow.begin_epoch(epoch);
        merge("begin_epoch", p, s)
    }

    fn end_epoch(&mut self) -> Result<()> {
        let p = self.primary.end_epoch();
        let s = self.shadow.end_epoch();
        merge("end_epoch", p, s)
    }

    fn begin_block(&mut self, block: u64) -> Result<()> {
        self.block = Some(block);
        let p = self.primary.begin_block(block);
        let s = self.shadow.begin_block(block);
        merge("begin_block", p, s)
    }

    fn end_block(&mut self) -> Result<()> {
        self.block = None;
        let p = self.primary.end_block();
        let s = self.shadow.end_block();
        merge("end_block", p, s)
    }

    fn begin_transaction(&mut self, transaction: u32) -> Result<()> {
        let p = self.primary.begin_transaction(transaction);
        let s = self.shadow.begin_transaction(transaction);
        merge("begin_transaction", p, s)
    }

    fn end_transaction(&mut self) -> Result<()> {
        let p = self.primary.end_transaction();
        let s = self.shadow.end_transaction();
        merge("end_transaction", p, s)
    }

    fn create_account(&mut self, address: &Address) -> Result<()> {
        let p = self.primary.create_account(address);
        let s = self.shadow.create_account(address);
        merge("create_account", p, s)
    }

    fn delete_account(&mut self, address: &Address) -> Result<()> {
        let p = self.primary.delete_account(address);
        let s = self.shadow.delete_account(address);
        merge("delete_account", p, s)
    }

    fn set_balance(&mut self, address: &Address, balance: u128) -> Result<()> {
        let p = self.primary.set_balance(address, balance);
        let s = self.shadow.set_balance(address, balance);
        merge("set_balance", p, s)
    }

    fn set_nonce(&mut self, address: &Address, nonce: u64) -> Result<()> {
        let p = self.primary.set_nonce(address, nonce);
        let s = self.shadow.set_nonce(address, nonce);
        merge("set_nonce", p, s)
    }

    fn set_code(&mut self, address: &Address, code: &[u8]) -> Result<()> {
        let p = self.primary.set_code(address, code);
        let s = self.shadow.set_code(address, code);
        merge("set_code", p, s)
    }

    fn set_state(&mut self, address: &Address, key: &Hash, value: &Hash) -> Result<()> {
        let p = self.primary.set_state(address, key, value);
        let s = self.shadow.set_state(address, key, value);
        merge("set_state", p, s)
    }

    fn exists(&self, address: &Address) -> Result<bool> {
        self.compare(
            "exists",
            address,
            None,
            self.primary.exists(address),
            self.shadow.exists(address),
        )
    }

    fn get_balance(&self, address: &Address) -> Result<u128> {
        self.compare(
            "get_balance",
            address,
            None,
            self.primary.get_balance(address),
            self.shadow.get_balance(address),
        )
    }

    fn get_nonce(&self, address: &Address) -> Result<u64> {
        self.compare(
            "get_nonce",
            address,
            None,
            self.primary.get_nonce(address),
            self.shadow.get_nonce(address),
        )
    }

    fn get_code(&self, address: &Address) -> Result<Vec<u8>> {
        self.compare(
            "get_code",
            address,
            None,
            self.primary.get_code(address),
            self.shadow.get_code(address),
        )
    }

    fn get_code_hash(&self, address: &Address) -> Result<Hash> {
        self.compare(
            "get_code_hash",
            address,
            None,
            self.primary.get_code_hash(address),
            self.shadow.get_code_hash(address),
        )
    }

    fn get_state(&self, address: &Address, key: &Hash) -> Result<Hash> {
        self.compare(
            "get_state",
            address,
            Some(*key),
            self.primary.get_state(address, key),
            self.shadow.get_state(address, key),
        )
    }

    fn memory_usage(&self) -> Option<MemoryUsage> {
        let primary = self.primary.memory_usage();
        let shadow = self.shadow.memory_usage();
        if primary.is_none() && shadow.is_none() {
            return None;
        }
        let primary = primary.unwrap_or_default();
        let shadow = shadow.unwrap_or_default();
        Some(MemoryUsage {
            used_bytes: primary.used_bytes + shadow.used_bytes,
            breakdown: format!(
                "primary: {}\nshadow: {}",
                primary.breakdown, shadow.breakdown
            ),
        })
    }

    fn start_bulk_load(&mut self, block: u64) -> Result<Box<dyn BulkLoad + '_>> {
        let primary = self
            .primary
            .start_bulk_load(block)
            .context("primary backend failed in start_bulk_load")?;
        let shadow = self
            .shadow
            .start_bulk_load(block)
            .context("shadow backend failed in start_bulk_load")?;
        Ok(Box::new(ShadowBulkLoad { primary, shadow }))
    }

    fn close(&mut self) -> Result<()> {
        let p = self.primary.close();
        let s = self.shadow.close();
        merge("close", p, s)
    }
}

impl<P: ArchiveBackend, S: ArchiveBackend> ArchiveBackend for ShadowBackend<P, S> {
    fn open_archive_snapshot(&self, block: u64) -> Result<Box<dyn StateBackend>> {
        let mut primary = self
            .primary
            .open_archive_snapshot(block)
            .context("primary backend failed in open_archive_snapshot")?;
        let shadow = match self.shadow.open_archive_snapshot(block) {
            Ok(shadow) => shadow,
            Err(e) => {
                if let Err(close_err) = primary.close() {
                    warn!(block, error = %close_err, "closing primary snapshot failed");
                }
                return Err(e.context("shadow backend failed in open_archive_snapshot"));
            }
        };
        let snapshot = ShadowBackend::new(primary, shadow)
            .with_log(self.log.clone())
            .with_policy(self.policy);
        Ok(Box::new(snapshot))
    }
}

struct ShadowBulkLoad<'a> {
    primary: Box<dyn BulkLoad + 'a>,
    shadow: Box<dyn BulkLoad + 'a>,
}

impl BulkLoad for ShadowBulkLoad<'_> {
    fn create_account(&mut self, address: &Address) -> Result<()> {
        let p = self.primary.create_account(address);
        let s = self.shadow.create_account(address);
        merge("bulk create_account", p, s)
    }

    fn set_balance(&mut self, address: &Address, balance: u128) -> Result<()> {
        let p = self.primary.set_balance(address, balance);
        let s = self.shadow.set_balance(address, balance);
        merge("bulk set_balance", p, s)
    }

    fn set_nonce(&mut self, address: &Address, nonce: u64) -> Result<()> {
        let p = self.primary.set_nonce(address, nonce);
        let s = self.shadow.set_nonce(address, nonce);
        merge("bulk set_nonce", p, s)
    }

    fn set_code(&mut self, address: &Address, code: &[u8]) -> Result<()> {
        let p = self.primary.set_code(address, code);
        let s = self.shadow.set_code(address, code);
        merge("bulk set_code", p, s)
    }

    fn set_state(&mut self, address: &Address, key: &Hash, value: &Hash) -> Result<()> {
        let p = self.primary.set_state(address, key, value);
        let s = self.shadow.set_state(address, key, value);
        merge("bulk set_state", p, s)
    }

    fn close(self: Box<Self>) -> Result<()> {
        let ShadowBulkLoad { primary, shadow } = *self;
        let p = primary.close();
        let s = shadow.close();
        merge("bulk close", p, s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::LoggingBackend;
    use crate::memory::InMemoryBackend;

    fn in_tx<B: StateBackend>(backend: &mut B, block: u64, f: impl FnOnce(&mut B)) {
        backend.begin_block(block).unwrap();
        backend.begin_transaction(0).unwrap();
        f(backend);
        backend.end_transaction().unwrap();
        backend.end_block().unwrap();
    }

    #[test]
    fn test_agreeing_backends_record_nothing() {
        let mut backend = ShadowBackend::new(InMemoryBackend::new(), InMemoryBackend::new());
        let addr = Address::from_low_u64(1);
        in_tx(&mut backend, 1, |b| b.set_balance(&addr, 42).unwrap());
        assert_eq!(backend.get_balance(&addr).unwrap(), 42);
        assert!(backend.exists(&addr).unwrap());
        assert!(backend.log().is_empty());
    }

    #[test]
    fn test_divergence_is_reported_not_fatal() {
        let addr = Address::from_low_u64(1);
        let mut diverged = InMemoryBackend::new();
        in_tx(&mut diverged, 1, |b| b.set_balance(&addr, 7).unwrap());

        let mut reference = InMemoryBackend::new();
        in_tx(&mut reference, 1, |b| b.set_balance(&addr, 5).unwrap());

        let backend = ShadowBackend::new(reference, diverged);
        assert_eq!(backend.get_balance(&addr).unwrap(), 5);

        let mismatches = backend.log().mismatches();
        assert_eq!(mismatches.len(), 1);
        assert_eq!(mismatches[0].call, "get_balance");
        assert_eq!(mismatches[0].primary, "5");
        assert_eq!(mismatches[0].shadow, "7");
    }

    #[test]
    fn test_fail_policy_surfaces_mismatch_error() {
        let addr = Address::from_low_u64(2);
        let key = Hash::from_low_u64(1);
        let mut diverged = InMemoryBackend::new();
        in_tx(&mut diverged, 1, |b| {
            b.set_state(&addr, &key, &Hash::from_low_u64(9)).unwrap()
        });

        let mut backend = ShadowBackend::new(InMemoryBackend::new(), diverged)
            .with_policy(MismatchPolicy::Fail);
        backend.begin_block(2).unwrap();
        let err = backend.get_state(&addr, &key).unwrap_err();
        let mismatch = err.downcast_ref::<ValidationMismatch>().unwrap();
        assert_eq!(mismatch.key, Some(key));
        assert_eq!(mismatch.block, Some(2));
        assert!(err.to_string().contains("at block 2"));
    }

    #[test]
    fn test_lifecycle_error_in_either_half_is_returned() {
        let mut shadow_closed = InMemoryBackend::new();
        shadow_closed.close().unwrap();
        let mut backend = ShadowBackend::new(InMemoryBackend::new(), shadow_closed);
        let err = backend.begin_block(1).unwrap_err();
        assert!(err.to_string().contains("shadow backend failed in begin_block"));
        // The primary still received the call.
        let (mut primary, _) = backend.into_inner();
        assert!(primary.begin_block(1).is_err());
    }

    #[test]
    fn test_archive_snapshots_share_the_log() {
        let addr = Address::from_low_u64(1);
        let mut primary = InMemoryBackend::new().with_archive();
        in_tx(&mut primary, 1, |b| b.set_nonce(&addr, 1).unwrap());
        let mut shadow = InMemoryBackend::new().with_archive();
        in_tx(&mut shadow, 1, |b| b.set_nonce(&addr, 2).unwrap());

        let log = ValidationLog::new();
        let backend = ShadowBackend::new(primary, shadow).with_log(log.clone());
        let snapshot = backend.open_archive_snapshot(1).unwrap();
        assert_eq!(snapshot.get_nonce(&addr).unwrap(), 1);
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn test_failed_shadow_snapshot_releases_primary() {
        let mut archive = InMemoryBackend::new().with_archive();
        archive.begin_block(1).unwrap();
        archive.end_block().unwrap();
        let primary = LoggingBackend::new(archive, "primary");
        let handles = primary.handles();

        // No archive on the shadow side, so its open fails.
        let backend = ShadowBackend::new(primary, InMemoryBackend::new());
        let err = backend.open_archive_snapshot(1).err().expect("expected error");
        assert!(err
            .to_string()
            .contains("shadow backend failed in open_archive_snapshot"));
        assert_eq!(handles.opened(), 1);
        assert_eq!(handles.closed(), 1);
    }

    #[test]
    fn test_bulk_load_reaches_both() {
        let mut backend = ShadowBackend::new(InMemoryBackend::new(), InMemoryBackend::new());
        let addr = Address::from_low_u64(5);
        {
            let mut load = backend.start_bulk_load(0).unwrap();
            load.create_account(&addr).unwrap();
            load.set_code(&addr, b"code").unwrap();
            load.close().unwrap();
        }
        let (primary, shadow) = backend.into_inner();
        assert_eq!(primary.world_state(), shadow.world_state());
        assert_eq!(primary.world_state().get(&addr).unwrap().code, b"code".to_vec());
    }
}
