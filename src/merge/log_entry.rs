//! Transactional log entry recording one merge.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::booking::Booking;
use crate::{
    id::{DatabaseId, ObjectId, TableId},
    mvcc::Timestamp,
    object::ObjectEntry,
};

/// "Objects `merged` become removed, objects `created` become visible" for
/// one table, plus the row relocation between them. Visible only once the
/// owning transaction commits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeObjectsEntry {
    db_id: DatabaseId,
    table_id: TableId,
    start_ts: Timestamp,
    merged: Vec<ObjectEntry>,
    created: Vec<ObjectEntry>,
    booking: Booking,
    block_offsets: Vec<usize>,
}

/// A tombstone redirected from a merged row onto its relocated copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferredTombstone {
    /// Created object holding the relocated row.
    pub object: ObjectId,
    /// Block within the created object.
    pub block: u16,
    /// Row within the block.
    pub row: u32,
    /// Commit timestamp of the original delete.
    pub ts: Timestamp,
}

impl MergeObjectsEntry {
    /// Build the entry for a merge that started at `start_ts`.
    pub fn new(
        db_id: DatabaseId,
        table_id: TableId,
        start_ts: Timestamp,
        merged: Vec<ObjectEntry>,
        created: Vec<ObjectEntry>,
        booking: Booking,
    ) -> Self {
        let mut block_offsets = Vec::with_capacity(merged.len());
        let mut total = 0;
        for entry in &merged {
            block_offsets.push(total);
            total += entry.block_count();
        }
        Self {
            db_id,
            table_id,
            start_ts,
            merged,
            created,
            booking,
            block_offsets,
        }
    }

    /// Database of the merged table.
    pub fn db_id(&self) -> DatabaseId {
        self.db_id
    }

    /// Merged table.
    pub fn table_id(&self) -> TableId {
        self.table_id
    }

    /// Start timestamp of the merging transaction.
    pub fn start_ts(&self) -> Timestamp {
        self.start_ts
    }

    /// Objects removed by the merge.
    pub fn merged(&self) -> &[ObjectEntry] {
        &self.merged
    }

    /// Objects produced by the merge.
    pub fn created(&self) -> &[ObjectEntry] {
        &self.created
    }

    /// Row relocation map.
    pub fn booking(&self) -> &Booking {
        &self.booking
    }

    /// Redirect a tombstone on a merged row to the row's new location.
    ///
    /// Returns `None` when `object` was not merged by this entry, when
    /// `(block, row)` lies outside it, or when the row did not survive the
    /// merge.
    pub fn transfer_tombstone(
        &self,
        object: &ObjectId,
        block: u16,
        row: u32,
        ts: Timestamp,
    ) -> Option<TransferredTombstone> {
        let idx = self.merged.iter().position(|entry| entry.id() == *object)?;
        let rows = self.merged[idx].stats().blocks().get(usize::from(block))?.rows;
        if row >= rows {
            return None;
        }
        let offset = self.block_offsets[idx] + usize::from(block);
        let to = self.booking.lookup(offset, row as usize)?;
        let created = self.created.get(to.object as usize)?;
        Some(TransferredTombstone {
            object: created.id(),
            block: to.block,
            row: to.row,
            ts,
        })
    }

    /// Whether `object` is one of the merged objects.
    pub fn merges(&self, object: &ObjectId) -> bool {
        self.merged.iter().any(|entry| entry.id() == *object)
    }
}

impl fmt::Display for MergeObjectsEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "merge {}.{} [", self.db_id, self.table_id)?;
        for (i, entry) in self.merged.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}", entry.id())?;
        }
        f.write_str("] -> [")?;
        for (i, entry) in self.created.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}", entry.id())?;
        }
        f.write_str("]")
    }
}
