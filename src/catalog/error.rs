use arrow::error::ArrowError;

use crate::{
    id::{DatabaseId, IdExhausted, ObjectId, TableId},
    pool::PoolError,
};

/// Catalog lookups and transactional mutations.
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    /// No database with this id is visible to the transaction.
    #[error("database {0} not found")]
    DatabaseNotFound(DatabaseId),
    /// No table with this id is visible to the transaction.
    #[error("table {table} not found in database {db}")]
    TableNotFound {
        /// Database searched.
        db: DatabaseId,
        /// Missing table.
        table: TableId,
    },
    /// A table with this id already exists.
    #[error("table {table} already exists in database {db}")]
    TableExists {
        /// Database searched.
        db: DatabaseId,
        /// Duplicate table.
        table: TableId,
    },
    /// The object is not visible to the transaction.
    #[error("object {0} not found")]
    ObjectNotFound(ObjectId),
    /// An object with this id already exists.
    #[error("object {0} already exists")]
    ObjectExists(ObjectId),
    /// The transaction already soft-deleted this object.
    #[error("object {0} already soft-deleted")]
    AlreadyDeleted(ObjectId),
    /// Another transaction committed a conflicting change to this object.
    #[error("write-write conflict on object {0}")]
    WriteConflict(ObjectId),
    /// Committed objects cannot change stats or flags.
    #[error("object {0} is immutable")]
    Immutable(ObjectId),
    /// The row address lies outside the object.
    #[error("row {row} of block {block} is outside object {object}")]
    RowOutOfRange {
        /// Object addressed.
        object: ObjectId,
        /// Block within the object.
        block: u16,
        /// Row within the block.
        row: u32,
    },
    /// The transaction already committed or rolled back.
    #[error("transaction is no longer active")]
    TxnClosed,
    /// Fault injected by a test harness.
    #[error("injected catalog fault: {0}")]
    Injected(String),
}

/// Reading or writing object data.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Arrow kernel or batch construction failed.
    #[error("arrow error: {0}")]
    Arrow(#[from] ArrowError),
    /// The backing store has no data for the object.
    #[error("object {0} has no stored data")]
    MissingObject(ObjectId),
    /// The block offset is past the end of the object.
    #[error("block {block} out of range for object {object}")]
    BlockOutOfRange {
        /// Object read.
        object: ObjectId,
        /// Requested block.
        block: u16,
    },
    /// The projection names a column the table does not have.
    #[error("unknown column index {0}")]
    UnknownColumn(usize),
    /// The delete mask does not cover the block.
    #[error("delete mask covers {mask} rows but block has {rows}")]
    MaskLength {
        /// Rows in the block.
        rows: usize,
        /// Rows covered by the mask.
        mask: usize,
    },
    /// The writer was used after finishing or without any block.
    #[error("object writer misuse: {0}")]
    Writer(&'static str),
    /// No object id could be allocated.
    #[error(transparent)]
    Ids(#[from] IdExhausted),
    /// Materializing the block would exceed the merge pool.
    #[error(transparent)]
    Pool(#[from] PoolError),
    /// Fault injected by a test harness.
    #[error("injected storage fault: {0}")]
    Injected(String),
}
