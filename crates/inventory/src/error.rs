use thiserror::Error;

use stockbook_core::LedgerEntryId;

use crate::entry::PartitionKey;

/// Ledger invariant failures detected by the pure domain code.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("entry {0} is already reversed")]
    AlreadyReversed(LedgerEntryId),

    #[error("entry {0} is a reversal and cannot be reversed")]
    ReversalOfReversal(LedgerEntryId),

    #[error("entry {entry} does not belong to partition {partition}")]
    ForeignPartition {
        entry: LedgerEntryId,
        partition: PartitionKey,
    },

    #[error("partition rows out of order at entry {0}")]
    Unordered(LedgerEntryId),

    #[error("anchor entry {anchor} is not before the rebuild window")]
    AnchorInsideWindow { anchor: LedgerEntryId },
}
