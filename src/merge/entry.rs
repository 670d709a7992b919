use serde::{Deserialize, Serialize};

use super::booking::Booking;
use crate::{
    id::{DatabaseId, TableId},
    mvcc::Timestamp,
    object::ObjectStats,
};

/// Everything the catalog applier needs to publish one merge.
///
/// Built once per task from the table identity, the transaction start
/// timestamp and the source stats. The engine appends created stats and the
/// booking as objects close.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeCommitEntry {
    /// Database of the merged table.
    pub db_id: DatabaseId,
    /// Merged table.
    pub table_id: TableId,
    /// Table name, for diagnostics.
    pub table_name: String,
    /// Start timestamp of the merging transaction.
    pub start_ts: Timestamp,
    /// Stats of the source objects, in merge order.
    pub merged_objects: Vec<ObjectStats>,
    /// Stats of the objects produced, in creation order.
    pub created_objects: Vec<ObjectStats>,
    /// Relocation of every surviving source row.
    pub booking: Booking,
}

impl MergeCommitEntry {
    /// Number of blocks across all source objects.
    pub fn source_blocks(&self) -> usize {
        self.merged_objects.iter().map(ObjectStats::block_count).sum()
    }

    /// Rows written to created objects.
    pub fn created_rows(&self) -> u64 {
        self.created_objects.iter().map(ObjectStats::rows).sum()
    }

    /// Rows stored in source objects, tombstoned or not.
    pub fn merged_rows(&self) -> u64 {
        self.merged_objects.iter().map(ObjectStats::rows).sum()
    }
}
