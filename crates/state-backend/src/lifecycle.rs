//! Bracket bookkeeping for backend lifecycle calls.
//!
//! Backends embed a [`LifecycleGuard`] and consult it on every call. Calls
//! outside a matching bracket fail fast with a [`LifecycleError`] instead of
//! being silently ignored.

use std::fmt;

/// The three nested lifecycle brackets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bracket {
    Epoch,
    Block,
    Transaction,
}

impl fmt::Display for Bracket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Bracket::Epoch => write!(f, "epoch"),
            Bracket::Block => write!(f, "block"),
            Bracket::Transaction => write!(f, "transaction"),
        }
    }
}

/// Misuse of the lifecycle contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleError {
    /// A bracket was opened while one of the same kind is still open.
    AlreadyOpen { bracket: Bracket, current: u64 },
    /// A bracket was closed without being opened.
    NotOpen { bracket: Bracket },
    /// An operation that needs an open bracket was called outside it.
    OutsideBracket {
        operation: &'static str,
        required: Bracket,
    },
    /// An operation that needs an idle backend was called inside a bracket.
    Busy {
        operation: &'static str,
        open: Bracket,
    },
    /// The handle has already been closed.
    Closed { operation: &'static str },
}

impl fmt::Display for LifecycleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleError::AlreadyOpen { bracket, current } => {
                write!(f, "cannot begin {}: {} {} is still open", bracket, bracket, current)
            }
            LifecycleError::NotOpen { bracket } => {
                write!(f, "cannot end {}: no {} is open", bracket, bracket)
            }
            LifecycleError::OutsideBracket {
                operation,
                required,
            } => write!(f, "{} called outside of an open {}", operation, required),
            LifecycleError::Busy { operation, open } => {
                write!(f, "{} called while a {} is open", operation, open)
            }
            LifecycleError::Closed { operation } => {
                write!(f, "{} called on a closed backend", operation)
            }
        }
    }
}

impl std::error::Error for LifecycleError {}

/// Tracks which lifecycle brackets are currently open on a backend handle.
#[derive(Debug, Default, Clone)]
pub struct LifecycleGuard {
    epoch: Option<u64>,
    block: Option<u64>,
    transaction: Option<u32>,
    closed: bool,
}

impl LifecycleGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current_epoch(&self) -> Option<u64> {
        self.epoch
    }

    pub fn current_block(&self) -> Option<u64> {
        self.block
    }

    pub fn current_transaction(&self) -> Option<u32> {
        self.transaction
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Fail if the handle has been closed.
    pub fn ensure_open(&self, operation: &'static str) -> Result<(), LifecycleError> {
        if self.closed {
            return Err(LifecycleError::Closed { operation });
        }
        Ok(())
    }

    pub fn begin_epoch(&mut self, epoch: u64) -> Result<(), LifecycleError> {
        self.ensure_open("begin_epoch")?;
        if let Some(current) = self.epoch {
            return Err(LifecycleError::AlreadyOpen {
                bracket: Bracket::Epoch,
                current,
            });
        }
        if self.block.is_some() {
            return Err(LifecycleError::Busy {
                operation: "begin_epoch",
                open: Bracket::Block,
            });
        }
        self.epoch = Some(epoch);
        Ok(())
    }

    pub fn end_epoch(&mut self) -> Result<u64, LifecycleError> {
        self.ensure_open("end_epoch")?;
        if self.block.is_some() {
            return Err(LifecycleError::Busy {
                operation: "end_epoch",
                open: Bracket::Block,
            });
        }
        self.epoch.take().ok_or(LifecycleError::NotOpen {
            bracket: Bracket::Epoch,
        })
    }

    pub fn begin_block(&mut self, block: u64) -> Result<(), LifecycleError> {
        self.ensure_open("begin_block")?;
        if let Some(current) = self.block {
            return Err(LifecycleError::AlreadyOpen {
                bracket: Bracket::Block,
                current,
            });
        }
        self.block = Some(block);
        Ok(())
    }

    /// Close the open block, returning its number.
    pub fn end_block(&mut self) -> Result<u64, LifecycleError> {
        self.ensure_open("end_block")?;
        if self.transaction.is_some() {
            return Err(LifecycleError::Busy {
                operation: "end_block",
                open: Bracket::Transaction,
            });
        }
        self.block.take().ok_or(LifecycleError::NotOpen {
            bracket: Bracket::Block,
        })
    }

    pub fn begin_transaction(&mut self, transaction: u32) -> Result<(), LifecycleError> {
        self.ensure_open("begin_transaction")?;
        if self.block.is_none() {
            return Err(LifecycleError::OutsideBracket {
                operation: "begin_transaction",
                required: Bracket::Block,
            });
        }
        if let Some(current) = self.transaction {
            return Err(LifecycleError::AlreadyOpen {
                bracket: Bracket::Transaction,
                current: current as u64,
            });
        }
        self.transaction = Some(transaction);
        Ok(())
    }

    pub fn end_transaction(&mut self) -> Result<u32, LifecycleError> {
        self.ensure_open("end_transaction")?;
        self.transaction.take().ok_or(LifecycleError::NotOpen {
            bracket: Bracket::Transaction,
        })
    }

    /// Mutations are only legal inside a transaction.
    pub fn require_transaction(&self, operation: &'static str) -> Result<(), LifecycleError> {
        self.ensure_open(operation)?;
        if self.transaction.is_none() {
            return Err(LifecycleError::OutsideBracket {
                operation,
                required: Bracket::Transaction,
            });
        }
        Ok(())
    }

    /// Bulk loading is only legal while no block is open.
    pub fn require_idle(&self, operation: &'static str) -> Result<(), LifecycleError> {
        self.ensure_open(operation)?;
        if self.block.is_some() {
            return Err(LifecycleError::Busy {
                operation,
                open: Bracket::Block,
            });
        }
        Ok(())
    }

    /// Mark the handle closed. Returns `false` if it was already closed.
    pub fn close(&mut self) -> bool {
        if self.closed {
            return false;
        }
        self.closed = true;
        self.transaction = None;
        self.block = None;
        self.epoch = None;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nested_brackets_in_order() {
        let mut guard = LifecycleGuard::new();
        guard.begin_epoch(0).unwrap();
        guard.begin_block(10).unwrap();
        guard.begin_transaction(1).unwrap();
        guard.require_transaction("set_balance").unwrap();
        assert_eq!(guard.end_transaction().unwrap(), 1);
        assert_eq!(guard.end_block().unwrap(), 10);
        assert_eq!(guard.end_epoch().unwrap(), 0);
    }

    #[test]
    fn test_transaction_requires_block() {
        let mut guard = LifecycleGuard::new();
        assert_eq!(
            guard.begin_transaction(0),
            Err(LifecycleError::OutsideBracket {
                operation: "begin_transaction",
                required: Bracket::Block,
            })
        );
    }

    #[test]
    fn test_end_block_with_open_transaction_fails() {
        let mut guard = LifecycleGuard::new();
        guard.begin_block(1).unwrap();
        guard.begin_transaction(0).unwrap();
        assert!(matches!(
            guard.end_block(),
            Err(LifecycleError::Busy {
                open: Bracket::Transaction,
                ..
            })
        ));
    }

    #[test]
    fn test_double_begin_block_reports_current() {
        let mut guard = LifecycleGuard::new();
        guard.begin_block(7).unwrap();
        let err = guard.begin_block(8).unwrap_err();
        assert_eq!(err.to_string(), "cannot begin block: block 7 is still open");
    }

    #[test]
    fn test_mutation_outside_transaction_fails() {
        let mut guard = LifecycleGuard::new();
        guard.begin_block(1).unwrap();
        assert!(guard.require_transaction("set_nonce").is_err());
        assert!(guard.require_idle("start_bulk_load").is_err());
    }

    #[test]
    fn test_close_is_idempotent_and_blocks_further_calls() {
        let mut guard = LifecycleGuard::new();
        guard.begin_block(3).unwrap();
        assert!(guard.close());
        assert!(!guard.close());
        assert_eq!(
            guard.begin_block(4),
            Err(LifecycleError::Closed {
                operation: "begin_block"
            })
        );
    }
}
