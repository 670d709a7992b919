//! Object metadata: statistics produced by writers and the catalog entry that
//! wraps them.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::id::{DatabaseId, ObjectId, TableId};

/// Size of one block inside an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockInfo {
    /// Rows stored in the block, including rows tombstoned later.
    pub rows: u32,
    /// Approximate in-memory size of the block payload.
    pub bytes: u64,
}

/// Sort-key bound encoded with Arrow's order-preserving row format.
///
/// Bounds from the same table compare bytewise in key order.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct KeyBound(Vec<u8>);

impl KeyBound {
    /// Wrap row-encoded key bytes.
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Encoded bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for KeyBound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyBound({} bytes)", self.0.len())
    }
}

/// Finalized statistics of an object, written once by its writer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectStats {
    id: ObjectId,
    blocks: Vec<BlockInfo>,
    rows: u64,
    bytes: u64,
    sorted: bool,
    min_key: Option<KeyBound>,
    max_key: Option<KeyBound>,
}

impl ObjectStats {
    /// Assemble statistics from the block layout.
    pub fn new(id: ObjectId, blocks: Vec<BlockInfo>, sorted: bool) -> Self {
        let rows = blocks.iter().map(|b| u64::from(b.rows)).sum();
        let bytes = blocks.iter().map(|b| b.bytes).sum();
        Self {
            id,
            blocks,
            rows,
            bytes,
            sorted,
            min_key: None,
            max_key: None,
        }
    }

    /// Attach sort-key bounds.
    pub fn with_key_bounds(mut self, min: Option<KeyBound>, max: Option<KeyBound>) -> Self {
        self.min_key = min;
        self.max_key = max;
        self
    }

    /// Identifier of the described object.
    pub fn id(&self) -> ObjectId {
        self.id
    }

    /// Per-block layout.
    pub fn blocks(&self) -> &[BlockInfo] {
        &self.blocks
    }

    /// Number of blocks.
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Total stored rows.
    pub fn rows(&self) -> u64 {
        self.rows
    }

    /// Total approximate bytes.
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Whether rows are ordered by the table sort key across the whole object.
    pub fn is_sorted(&self) -> bool {
        self.sorted
    }

    /// Smallest sort key, when the table has one.
    pub fn min_key(&self) -> Option<&KeyBound> {
        self.min_key.as_ref()
    }

    /// Largest sort key, when the table has one.
    pub fn max_key(&self) -> Option<&KeyBound> {
        self.max_key.as_ref()
    }
}

/// Catalog-side view of an object: owning table, stats and sorted flag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectEntry {
    db_id: DatabaseId,
    table_id: TableId,
    stats: ObjectStats,
    sorted: bool,
}

impl ObjectEntry {
    /// Entry for an object of table `(db_id, table_id)`.
    pub fn new(db_id: DatabaseId, table_id: TableId, stats: ObjectStats) -> Self {
        let sorted = stats.is_sorted();
        Self {
            db_id,
            table_id,
            stats,
            sorted,
        }
    }

    /// Owning database.
    pub fn db_id(&self) -> DatabaseId {
        self.db_id
    }

    /// Owning table.
    pub fn table_id(&self) -> TableId {
        self.table_id
    }

    /// Object identifier.
    pub fn id(&self) -> ObjectId {
        self.stats.id()
    }

    /// Current statistics.
    pub fn stats(&self) -> &ObjectStats {
        &self.stats
    }

    /// Number of blocks in the object.
    pub fn block_count(&self) -> usize {
        self.stats.block_count()
    }

    /// Whether the catalog marks the object as sorted.
    pub fn is_sorted(&self) -> bool {
        self.sorted
    }

    pub(crate) fn set_stats(&mut self, stats: ObjectStats) {
        self.stats = stats;
    }

    pub(crate) fn set_sorted(&mut self) {
        self.sorted = true;
    }
}
