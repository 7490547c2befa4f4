//! Grouping of a record stream into per-block batches.

use anyhow::Result;
use replay_types::{TransactionRecord, TxPosition};

use crate::error::ReplayError;

/// Non-empty, ordered records of a single block.
#[derive(Debug, Clone)]
pub struct Batch<T> {
    block: u64,
    records: Vec<TransactionRecord<T>>,
}

impl<T> Batch<T> {
    fn start(record: TransactionRecord<T>) -> Self {
        Self {
            block: record.block,
            records: vec![record],
        }
    }

    pub fn block(&self) -> u64 {
        self.block
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Always `false`; a batch holds at least one record.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[TransactionRecord<T>] {
        &self.records
    }

    pub fn into_records(self) -> Vec<TransactionRecord<T>> {
        self.records
    }
}

/// Accumulates records while the block is unchanged.
///
/// ```ignore
/// let mut batcher = Batcher::new();
/// for record in records {
///     if let Some(batch) = batcher.push(record)? {
///         dispatch(batch);
///     }
/// }
/// if let Some(batch) = batcher.finish() {
///     dispatch(batch);
/// }
/// ```
#[derive(Debug)]
pub struct Batcher<T> {
    current: Option<Batch<T>>,
    last: Option<TxPosition>,
}

impl<T> Default for Batcher<T> {
    fn default() -> Self {
        Self {
            current: None,
            last: None,
        }
    }
}

impl<T> Batcher<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a record, returning the previous batch when the block changes.
    ///
    /// Fails with [`ReplayError::OutOfOrder`] unless the record strictly
    /// follows the previous one.
    pub fn push(&mut self, record: TransactionRecord<T>) -> Result<Option<Batch<T>>> {
        let position = record.position();
        if let Some(previous) = self.last {
            if position <= previous {
                return Err(ReplayError::OutOfOrder {
                    previous,
                    next: position,
                }
                .into());
            }
        }
        self.last = Some(position);

        if let Some(batch) = self.current.as_mut() {
            if batch.block == record.block {
                batch.records.push(record);
                return Ok(None);
            }
        }
        Ok(self.current.replace(Batch::start(record)))
    }

    /// Emit the final, partially filled batch.
    pub fn finish(&mut self) -> Option<Batch<T>> {
        self.current.take()
    }
}
