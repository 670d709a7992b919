//! Catalog and storage seams consumed by merge tasks.
//!
//! The transaction manager, the catalog's handle implementation and the
//! object reader live outside the merge path. They are reached through the
//! object-safe traits below, which expose typed accessors (`schema()`,
//! `object(id)`, ...) instead of handles that callers downcast. [`memory`]
//! provides a complete in-process implementation.

mod error;
pub mod memory;

use std::sync::Arc;

pub use error::{CatalogError, StorageError};
use futures_util::future::BoxFuture;

use crate::{
    block::BlockView,
    id::{DatabaseId, ObjectId, TableId},
    merge::MergeObjectsEntry,
    mvcc::Timestamp,
    object::{ObjectEntry, ObjectStats},
    pool::MergePool,
    schema::TableSchema,
};

/// A transaction as seen by a merge: snapshot timestamp, catalog access and
/// the write set the merge appends its log entry to.
pub trait Transaction: Send + Sync {
    /// Snapshot timestamp all reads of this transaction observe.
    fn start_ts(&self) -> Timestamp;

    /// Resolve a database visible to the transaction.
    fn database(&self, id: DatabaseId) -> Result<Arc<dyn Database>, CatalogError>;

    /// Append a merge log entry to the write set of table `(db, table)`.
    fn log_entry(
        &self,
        db: DatabaseId,
        table: TableId,
        entry: MergeObjectsEntry,
    ) -> Result<(), CatalogError>;
}

/// Database handle scoped to a transaction.
pub trait Database: Send + Sync {
    /// Database identifier.
    fn id(&self) -> DatabaseId;

    /// Resolve a table of this database.
    fn relation(&self, id: TableId) -> Result<Arc<dyn Relation>, CatalogError>;
}

/// Table handle scoped to a transaction.
pub trait Relation: Send + Sync {
    /// Table identifier.
    fn id(&self) -> TableId;

    /// Table schema.
    fn schema(&self) -> Arc<TableSchema>;

    /// Resolve an object visible to the transaction.
    fn object(&self, id: &ObjectId) -> Result<Arc<dyn ObjectHandle>, CatalogError>;

    /// Soft-delete an object as of this transaction's commit.
    fn soft_delete_object(&self, id: &ObjectId) -> Result<(), CatalogError>;

    /// Register a write-once object with a predetermined identifier.
    fn create_non_appendable_object(
        &self,
        id: ObjectId,
    ) -> Result<Arc<dyn ObjectHandle>, CatalogError>;
}

/// Object handle scoped to a transaction.
pub trait ObjectHandle: Send + Sync {
    /// Current catalog entry of the object.
    fn entry(&self) -> ObjectEntry;

    /// Attach finalized statistics to an object created by this transaction.
    fn update_stats(&self, stats: ObjectStats) -> Result<(), CatalogError>;

    /// Mark an object created by this transaction as sorted.
    fn set_sorted(&self) -> Result<(), CatalogError>;

    /// Materialize `columns` (logical indices) of block `block` together
    /// with the tombstones visible to the transaction's snapshot. The view's
    /// memory is reserved against `pool` until the view is dropped.
    fn read_block<'a>(
        &'a self,
        block: u16,
        columns: &'a [usize],
        pool: &'a MergePool,
    ) -> BoxFuture<'a, Result<BlockView, StorageError>>;
}
