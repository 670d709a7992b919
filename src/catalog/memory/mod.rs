//! In-process catalog implementing every merge-facing trait.
//!
//! State is multi-versioned by commit timestamp: objects carry a
//! [`Lifespan`] and tombstones carry the timestamp of the commit that wrote
//! them. Transactions read the snapshot at their start timestamp, stage their
//! writes privately and publish them atomically at commit.

mod faults;
mod store;
mod txn;

use std::{collections::BTreeMap, fmt, sync::Arc};

use arrow::{
    array::{RecordBatch, UInt32Array},
    compute::{concat_batches, filter_record_batch, take_record_batch},
    row::{RowConverter, SortField},
};
pub use faults::FaultInjector;
use parking_lot::Mutex;
pub use store::{MemObjectStore, MemWriterFactory};
use thiserror::Error;
pub use txn::MemTxn;

use super::{CatalogError, StorageError};
use crate::{
    block::DeleteMask,
    id::{DatabaseId, ObjectId, ObjectIdGenerator, TableId},
    merge::{ObjectStatsBuilder, WriterSpec},
    mvcc::{CommitClock, Lifespan, Timestamp},
    object::ObjectEntry,
    observability::log_debug,
    schema::TableSchema,
};

/// Failures of the catalog's direct (non-transactional) helpers.
#[derive(Debug, Error)]
pub enum IngestError {
    /// Catalog lookup failed.
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    /// Block data was rejected.
    #[error(transparent)]
    Storage(#[from] StorageError),
    /// A sorted object was requested for a table without sort key.
    #[error("table {0} has no sort key")]
    NoSortKey(TableId),
    /// A block does not carry the table's data columns.
    #[error("block does not match table schema {0}")]
    SchemaMismatch(String),
    /// Objects hold at least one block.
    #[error("object needs at least one block")]
    NoBlocks,
    /// Row positions of an object are addressed with `u32`.
    #[error("object of {0} rows exceeds the addressable row count")]
    TooManyRows(usize),
}

pub(crate) struct ObjectState {
    pub(crate) entry: ObjectEntry,
    pub(crate) lifespan: Lifespan,
    pub(crate) tombstones: BTreeMap<(u16, u32), Timestamp>,
}

impl ObjectState {
    /// Tombstones of `block` committed at or before `ts`.
    pub(crate) fn delete_mask(&self, block: u16, rows: usize, ts: Timestamp) -> DeleteMask {
        let deleted = self
            .tombstones
            .range((block, 0)..=(block, u32::MAX))
            .filter(|(_, committed)| **committed <= ts)
            .map(|((_, row), _)| *row as usize);
        DeleteMask::from_deleted(rows, deleted)
    }
}

pub(crate) struct TableState {
    pub(crate) schema: Arc<TableSchema>,
    pub(crate) objects: BTreeMap<ObjectId, ObjectState>,
}

#[derive(Default)]
pub(crate) struct CatalogState {
    pub(crate) clock: CommitClock,
    pub(crate) databases: BTreeMap<DatabaseId, BTreeMap<TableId, TableState>>,
}

impl CatalogState {
    pub(crate) fn table(&self, db: DatabaseId, table: TableId) -> Result<&TableState, CatalogError> {
        self.databases
            .get(&db)
            .ok_or(CatalogError::DatabaseNotFound(db))?
            .get(&table)
            .ok_or(CatalogError::TableNotFound { db, table })
    }

    pub(crate) fn table_mut(
        &mut self,
        db: DatabaseId,
        table: TableId,
    ) -> Result<&mut TableState, CatalogError> {
        self.databases
            .get_mut(&db)
            .ok_or(CatalogError::DatabaseNotFound(db))?
            .get_mut(&table)
            .ok_or(CatalogError::TableNotFound { db, table })
    }

    pub(crate) fn contains_object(&self, id: &ObjectId) -> bool {
        self.databases
            .values()
            .flat_map(BTreeMap::values)
            .any(|table| table.objects.contains_key(id))
    }
}

pub(crate) struct CatalogInner {
    pub(crate) state: Mutex<CatalogState>,
    pub(crate) store: MemObjectStore,
    pub(crate) faults: FaultInjector,
    pub(crate) ids: Arc<ObjectIdGenerator>,
}

/// Multi-version catalog plus object store, all in memory.
#[derive(Clone)]
pub struct MemCatalog {
    inner: Arc<CatalogInner>,
}

impl Default for MemCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl MemCatalog {
    /// Empty catalog whose clock starts at zero.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(CatalogInner {
                state: Mutex::new(CatalogState::default()),
                store: MemObjectStore::default(),
                faults: FaultInjector::default(),
                ids: Arc::new(ObjectIdGenerator::new()),
            }),
        }
    }

    /// Register database `id`; registering it twice is a no-op.
    pub fn create_database(&self, id: DatabaseId) {
        self.inner.state.lock().databases.entry(id).or_default();
    }

    /// Register table `id` of database `db`.
    pub fn create_table(
        &self,
        db: DatabaseId,
        id: TableId,
        schema: TableSchema,
    ) -> Result<(), CatalogError> {
        let mut state = self.inner.state.lock();
        let tables = state
            .databases
            .get_mut(&db)
            .ok_or(CatalogError::DatabaseNotFound(db))?;
        if tables.contains_key(&id) {
            return Err(CatalogError::TableExists { db, table: id });
        }
        tables.insert(
            id,
            TableState {
                schema: Arc::new(schema),
                objects: BTreeMap::new(),
            },
        );
        Ok(())
    }

    /// Commit a new unsorted object holding `blocks`.
    pub fn ingest_object(
        &self,
        db: DatabaseId,
        table: TableId,
        blocks: Vec<RecordBatch>,
    ) -> Result<ObjectEntry, IngestError> {
        let schema = self.schema(db, table)?;
        self.ingest(db, table, blocks, WriterSpec::for_table(&schema).unordered())
    }

    /// Commit a new sorted object. Rows of `blocks` are reordered by the
    /// table's sort key across the whole object; block sizes are kept.
    pub fn ingest_sorted_object(
        &self,
        db: DatabaseId,
        table: TableId,
        blocks: Vec<RecordBatch>,
    ) -> Result<ObjectEntry, IngestError> {
        let schema = self.schema(db, table)?;
        let spec = WriterSpec::for_table(&schema);
        let pos = spec.sort_key_pos.ok_or(IngestError::NoSortKey(table))?;
        check_blocks(&spec, &blocks)?;

        let all = concat_batches(&spec.schema, &blocks).map_err(StorageError::from)?;
        let converter = RowConverter::new(vec![SortField::new(
            spec.schema.field(pos).data_type().clone(),
        )])
        .map_err(StorageError::from)?;
        let keys = converter
            .convert_columns(&[all.column(pos).clone()])
            .map_err(StorageError::from)?;
        let mut order: Vec<u32> = (0..row_count(all.num_rows())?).collect();
        order.sort_by(|a, b| keys.row(*a as usize).cmp(&keys.row(*b as usize)));
        let sorted = take_record_batch(&all, &UInt32Array::from(order)).map_err(StorageError::from)?;

        let mut offset = 0;
        let resized = blocks
            .iter()
            .map(|block| {
                let slice = sorted.slice(offset, block.num_rows());
                offset += block.num_rows();
                slice
            })
            .collect();
        self.ingest(db, table, resized, spec)
    }

    fn ingest(
        &self,
        db: DatabaseId,
        table: TableId,
        blocks: Vec<RecordBatch>,
        spec: WriterSpec,
    ) -> Result<ObjectEntry, IngestError> {
        check_blocks(&spec, &blocks)?;
        let id = self.inner.ids.generate().map_err(StorageError::from)?;
        let mut stats = ObjectStatsBuilder::new(id, &spec).map_err(StorageError::from)?;
        for block in &blocks {
            stats.observe_block(block).map_err(StorageError::from)?;
        }
        let entry = ObjectEntry::new(db, table, stats.finish());

        let mut state = self.inner.state.lock();
        state.table(db, table)?;
        self.inner.store.put(id, blocks);
        let created_at = state.clock.tick();
        state.table_mut(db, table)?.objects.insert(
            id,
            ObjectState {
                entry: entry.clone(),
                lifespan: Lifespan::created(created_at),
                tombstones: BTreeMap::new(),
            },
        );
        log_debug!(
            component = "mem_catalog",
            event = "object_ingested",
            object = %id,
            rows = entry.stats().rows(),
            sorted = entry.is_sorted(),
            ts = created_at.get(),
        );
        Ok(entry)
    }

    /// Commit tombstones for `rows` of `block` of `object`. Rows already
    /// deleted keep their original timestamp. Nothing is written when any
    /// row lies outside the object.
    pub fn delete_rows(
        &self,
        db: DatabaseId,
        table: TableId,
        object: ObjectId,
        block: u16,
        rows: &[u32],
    ) -> Result<Timestamp, CatalogError> {
        let mut state = self.inner.state.lock();
        let now = state.clock.now();
        let obj = state
            .table(db, table)?
            .objects
            .get(&object)
            .filter(|obj| obj.lifespan.visible_at(now))
            .ok_or(CatalogError::ObjectNotFound(object))?;
        let block_rows = obj
            .entry
            .stats()
            .blocks()
            .get(usize::from(block))
            .map_or(0, |info| info.rows);
        if let Some(row) = rows.iter().find(|row| **row >= block_rows) {
            return Err(CatalogError::RowOutOfRange {
                object,
                block,
                row: *row,
            });
        }
        let ts = state.clock.tick();
        let obj = state
            .table_mut(db, table)?
            .objects
            .get_mut(&object)
            .ok_or(CatalogError::ObjectNotFound(object))?;
        for row in rows {
            obj.tombstones.entry((block, *row)).or_insert(ts);
        }
        Ok(ts)
    }

    /// Objects of the table visible to a snapshot taken now.
    pub fn visible_objects(
        &self,
        db: DatabaseId,
        table: TableId,
    ) -> Result<Vec<ObjectEntry>, CatalogError> {
        let state = self.inner.state.lock();
        let now = state.clock.now();
        Ok(state
            .table(db, table)?
            .objects
            .values()
            .filter(|obj| obj.lifespan.visible_at(now))
            .map(|obj| obj.entry.clone())
            .collect())
    }

    /// Live rows of every visible object, one batch per block, objects in
    /// creation order.
    pub fn scan_visible(
        &self,
        db: DatabaseId,
        table: TableId,
    ) -> Result<Vec<RecordBatch>, IngestError> {
        let state = self.inner.state.lock();
        let now = state.clock.now();
        let mut out = Vec::new();
        for (id, obj) in &state.table(db, table)?.objects {
            if !obj.lifespan.visible_at(now) {
                continue;
            }
            let blocks = self
                .inner
                .store
                .get(id)
                .ok_or(StorageError::MissingObject(*id))?;
            for (block, batch) in blocks.iter().enumerate() {
                let mask = obj.delete_mask(block as u16, batch.num_rows(), now);
                out.push(filter_record_batch(batch, &mask.live_filter()).map_err(StorageError::from)?);
            }
        }
        Ok(out)
    }

    /// Tombstoned `(block, row)` pairs of `object` visible now.
    pub fn deleted_rows(
        &self,
        db: DatabaseId,
        table: TableId,
        object: ObjectId,
    ) -> Result<Vec<(u16, u32)>, CatalogError> {
        let state = self.inner.state.lock();
        let now = state.clock.now();
        let obj = state
            .table(db, table)?
            .objects
            .get(&object)
            .ok_or(CatalogError::ObjectNotFound(object))?;
        Ok(obj
            .tombstones
            .iter()
            .filter(|(_, ts)| **ts <= now)
            .map(|(at, _)| *at)
            .collect())
    }

    /// Latest commit timestamp.
    pub fn now(&self) -> Timestamp {
        self.inner.state.lock().clock.now()
    }

    /// Start a transaction reading the current snapshot.
    pub fn begin(&self) -> MemTxn {
        let start_ts = self.now();
        MemTxn::new(Arc::clone(&self.inner), start_ts)
    }

    /// Failure switches.
    pub fn faults(&self) -> &FaultInjector {
        &self.inner.faults
    }

    /// Block data of all objects.
    pub fn store(&self) -> &MemObjectStore {
        &self.inner.store
    }

    /// Writer factory placing merge output in this catalog's store.
    pub fn writer_factory(&self) -> Arc<MemWriterFactory> {
        Arc::new(MemWriterFactory::new(
            self.inner.store.clone(),
            Arc::clone(&self.inner.ids),
            self.inner.faults.clone(),
        ))
    }

    fn schema(&self, db: DatabaseId, table: TableId) -> Result<Arc<TableSchema>, CatalogError> {
        Ok(Arc::clone(&self.inner.state.lock().table(db, table)?.schema))
    }
}

impl fmt::Debug for MemCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemCatalog")
            .field("now", &self.now())
            .field("store", &self.inner.store)
            .finish_non_exhaustive()
    }
}

fn row_count(rows: usize) -> Result<u32, IngestError> {
    u32::try_from(rows).map_err(|_| IngestError::TooManyRows(rows))
}

fn check_blocks(spec: &WriterSpec, blocks: &[RecordBatch]) -> Result<(), IngestError> {
    if blocks.is_empty() {
        return Err(IngestError::NoBlocks);
    }
    for block in blocks {
        if block.schema().fields() != spec.schema.fields() {
            return Err(IngestError::SchemaMismatch(format!(
                "expected {:?}, got {:?}",
                spec.schema.fields(),
                block.schema().fields()
            )));
        }
    }
    Ok(())
}
