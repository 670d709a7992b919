#![deny(missing_docs)]
//! Merge compaction for column-oriented, multi-version table objects.
//!
//! A [`MergeObjectsTask`](merge::MergeObjectsTask) takes several immutable
//! objects of one table, drops the rows already tombstoned at the
//! transaction's snapshot, sort-merges the rest by the table's sort key and
//! writes them into new objects capped at the table's block row limit. The
//! swap of old objects for new ones is staged in the merging transaction,
//! together with a log entry mapping every surviving row to its new
//! location, and becomes visible atomically when that transaction commits.
//!
//! Catalog, transaction and storage are reached through the traits in
//! [`catalog`]; [`catalog::memory`] implements all of them in process.

/// Block views and delete masks.
pub mod block;
/// Catalog, transaction and object access traits.
pub mod catalog;
/// Object, database and table identifiers.
pub mod id;
/// Merge tasks and the sort-merge-write engine.
pub mod merge;
/// Commit timestamps and snapshot visibility.
pub mod mvcc;
/// Object statistics and catalog entries.
pub mod object;
/// Memory accounting for materialized blocks.
pub mod pool;
/// Table schemas.
pub mod schema;

mod observability;

pub use crate::{
    catalog::{CatalogError, StorageError},
    id::{DatabaseId, ObjectId, TableId},
    merge::{MergeError, MergeObjectsTask, MergeOptions, MergeRuntime},
    mvcc::Timestamp,
    object::{ObjectEntry, ObjectStats},
    pool::MergePool,
    schema::TableSchema,
};
