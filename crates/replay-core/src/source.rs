//! Record sources: where transaction records come from.
//!
//! Two shapes are supported. A push source ([`RecordSource`]) owns iteration
//! and hands each record to a consumer; a pull source ([`RecordIterator`]) is
//! stepped by the caller and adapted into a push source by [`PullSource`].
//! Both must produce records in strictly ascending `(block, transaction)`
//! order. The engines verify this and fail with
//! [`ReplayError::OutOfOrder`](crate::error::ReplayError::OutOfOrder).

use anyhow::Result;
use replay_types::TransactionRecord;

/// Consumer callback of a push source.
pub type Consumer<'a, T> = dyn FnMut(TransactionRecord<T>) -> Result<()> + 'a;

/// A push-style record source.
pub trait RecordSource<T> {
    /// Feed every record with `first <= block <= last` to `consumer`, in order.
    ///
    /// An error returned by `consumer` must stop iteration and be returned
    /// unchanged.
    fn run(&mut self, first: u64, last: u64, consumer: &mut Consumer<'_, T>) -> Result<()>;
}

/// A pull-style record source.
pub trait RecordIterator<T> {
    /// Advance to the next record, returning `None` at the end of the stream.
    fn next_record(&mut self) -> Result<Option<TransactionRecord<T>>>;

    /// Release underlying resources. Called exactly once.
    fn release(&mut self) {}
}

/// Adapts a [`RecordIterator`] into a [`RecordSource`].
///
/// Records below `first` are skipped, iteration stops at the first record
/// beyond `last`, and the iterator is always released.
pub struct PullSource<I> {
    iter: I,
}

impl<I> PullSource<I> {
    pub fn new(iter: I) -> Self {
        Self { iter }
    }
}

impl<T, I: RecordIterator<T>> RecordSource<T> for PullSource<I> {
    fn run(&mut self, first: u64, last: u64, consumer: &mut Consumer<'_, T>) -> Result<()> {
        let result = (|| -> Result<()> {
            while let Some(record) = self.iter.next_record()? {
                if record.block < first {
                    continue;
                }
                if record.block > last {
                    break;
                }
                consumer(record)?;
            }
            Ok(())
        })();
        self.iter.release();
        result
    }
}

/// In-memory source over a vector of records.
#[derive(Debug, Clone, Default)]
pub struct VecSource<T> {
    records: Vec<TransactionRecord<T>>,
}

impl<T> VecSource<T> {
    pub fn new(records: Vec<TransactionRecord<T>>) -> Self {
        Self { records }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl<T> FromIterator<TransactionRecord<T>> for VecSource<T> {
    fn from_iter<I: IntoIterator<Item = TransactionRecord<T>>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

impl<T: Clone> RecordSource<T> for VecSource<T> {
    fn run(&mut self, first: u64, last: u64, consumer: &mut Consumer<'_, T>) -> Result<()> {
        for record in &self.records {
            if record.block < first {
                continue;
            }
            if record.block > last {
                break;
            }
            consumer(record.clone())?;
        }
        Ok(())
    }
}

/// Pull iterator over a vector, mainly for tests.
pub struct VecIterator<T> {
    records: std::vec::IntoIter<TransactionRecord<T>>,
    released: bool,
}

impl<T> VecIterator<T> {
    pub fn new(records: Vec<TransactionRecord<T>>) -> Self {
        Self {
            records: records.into_iter(),
            released: false,
        }
    }

    pub fn is_released(&self) -> bool {
        self.released
    }
}

impl<T> RecordIterator<T> for VecIterator<T> {
    fn next_record(&mut self) -> Result<Option<TransactionRecord<T>>> {
        Ok(self.records.next())
    }

    fn release(&mut self) {
        self.released = true;
    }
}
