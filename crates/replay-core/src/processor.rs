//! The per-transaction work unit.

use anyhow::Result;
use replay_types::TransactionRecord;

use crate::context::RunContext;

/// Executes one transaction against the backend reachable from the context.
///
/// Processors are shared by every worker of the parallel engine, so they take
/// `&self` and must be `Send + Sync`.
pub trait Processor<T>: Send + Sync {
    fn process(&self, record: &TransactionRecord<T>, ctx: &mut RunContext<'_>) -> Result<()>;
}

/// A [`Processor`] backed by a closure.
pub struct FnProcessor<F>(F);

impl<T, F> Processor<T> for FnProcessor<F>
where
    F: Fn(&TransactionRecord<T>, &mut RunContext<'_>) -> Result<()> + Send + Sync,
{
    fn process(&self, record: &TransactionRecord<T>, ctx: &mut RunContext<'_>) -> Result<()> {
        (self.0)(record, ctx)
    }
}

/// Build a processor from a closure.
///
/// ```ignore
/// let processor = from_fn(|record: &TransactionRecord<Transfer>, ctx: &mut RunContext<'_>| {
///     ctx.backend().set_balance(&record.payload.to, record.payload.amount)?;
///     ctx.record_work(21_000);
///     Ok(())
/// });
/// ```
pub fn from_fn<T, F>(f: F) -> FnProcessor<F>
where
    F: Fn(&TransactionRecord<T>, &mut RunContext<'_>) -> Result<()> + Send + Sync,
{
    FnProcessor(f)
}
