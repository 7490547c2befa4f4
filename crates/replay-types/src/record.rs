//! Transaction records: the unit of replay work.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Ordering key of a transaction inside a record stream.
///
/// Derived `Ord` compares `block` first, then `transaction`, which is exactly
/// the order a record source must produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TxPosition {
    pub block: u64,
    pub transaction: u32,
}

impl TxPosition {
    pub fn new(block: u64, transaction: u32) -> Self {
        Self { block, transaction }
    }
}

impl fmt::Display for TxPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.block, self.transaction)
    }
}

/// One historical transaction to replay.
///
/// The payload is opaque to the engine; it is handed to the processor and to
/// extensions unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRecord<T> {
    pub block: u64,
    pub transaction: u32,
    pub payload: T,
}

impl<T> TransactionRecord<T> {
    pub fn new(block: u64, transaction: u32, payload: T) -> Self {
        Self {
            block,
            transaction,
            payload,
        }
    }

    pub fn position(&self) -> TxPosition {
        TxPosition::new(self.block, self.transaction)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_position_orders_by_block_then_transaction() {
        let mut positions = vec![
            TxPosition::new(3, 1),
            TxPosition::new(2, 2),
            TxPosition::new(2, 1),
            TxPosition::new(4, 0),
        ];
        positions.sort();
        assert_eq!(
            positions,
            vec![
                TxPosition::new(2, 1),
                TxPosition::new(2, 2),
                TxPosition::new(3, 1),
                TxPosition::new(4, 0),
            ]
        );
    }

    #[test]
    fn test_record_position_display() {
        let record = TransactionRecord::new(500, 3, "payload");
        assert_eq!(record.position().to_string(), "500/3");
    }
}
