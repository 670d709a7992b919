use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    sync::Arc,
};

use arrow::{
    array::{ArrayRef, RecordBatch, UInt64Array},
    datatypes::{DataType, Field, Schema},
};
use futures_util::future::BoxFuture;
use parking_lot::Mutex;

use super::{CatalogInner, ObjectState};
use crate::{
    block::{BlockView, DeleteMask},
    catalog::{CatalogError, Database, ObjectHandle, Relation, StorageError, Transaction},
    id::{DatabaseId, ObjectId, TableId},
    merge::MergeObjectsEntry,
    mvcc::{Lifespan, Timestamp},
    object::{ObjectEntry, ObjectStats},
    observability::{log_debug, log_info},
    pool::MergePool,
    schema::{TableSchema, PHYS_ADDR_COLUMN},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxnState {
    Active,
    Committed(Timestamp),
    RolledBack,
}

struct StagedObject {
    db: DatabaseId,
    table: TableId,
    entry: ObjectEntry,
}

struct WriteSet {
    state: TxnState,
    soft_deletes: BTreeSet<(DatabaseId, TableId, ObjectId)>,
    creates: BTreeMap<ObjectId, StagedObject>,
    log: Vec<MergeObjectsEntry>,
}

impl WriteSet {
    fn ensure_active(&self) -> Result<(), CatalogError> {
        match self.state {
            TxnState::Active => Ok(()),
            _ => Err(CatalogError::TxnClosed),
        }
    }

    fn discard(&mut self) {
        self.soft_deletes.clear();
        self.creates.clear();
        self.log.clear();
    }
}

struct TxnInner {
    catalog: Arc<CatalogInner>,
    start_ts: Timestamp,
    writes: Mutex<WriteSet>,
}

/// Transaction over a [`MemCatalog`](super::MemCatalog).
///
/// Writes are staged privately and become visible at [`commit`](Self::commit).
/// Dropping an uncommitted transaction discards its writes.
#[derive(Clone)]
pub struct MemTxn {
    inner: Arc<TxnInner>,
}

impl MemTxn {
    pub(crate) fn new(catalog: Arc<CatalogInner>, start_ts: Timestamp) -> Self {
        Self {
            inner: Arc::new(TxnInner {
                catalog,
                start_ts,
                writes: Mutex::new(WriteSet {
                    state: TxnState::Active,
                    soft_deletes: BTreeSet::new(),
                    creates: BTreeMap::new(),
                    log: Vec::new(),
                }),
            }),
        }
    }

    /// Validate and publish the write set.
    ///
    /// Fails with [`CatalogError::WriteConflict`] when another transaction
    /// soft-deleted one of this transaction's soft-delete targets first.
    /// Tombstones committed on merged objects after this transaction started
    /// are carried over to the relocated rows of the created objects.
    pub fn commit(&self) -> Result<Timestamp, CatalogError> {
        let mut writes = self.inner.writes.lock();
        writes.ensure_active()?;
        let mut state = self.inner.catalog.state.lock();

        for (db, table, id) in &writes.soft_deletes {
            let obj = state
                .table(*db, *table)?
                .objects
                .get(id)
                .ok_or(CatalogError::ObjectNotFound(*id))?;
            if obj.lifespan.deleted_at().is_some() {
                return Err(CatalogError::WriteConflict(*id));
            }
        }
        for (id, staged) in &writes.creates {
            state.table(staged.db, staged.table)?;
            if state.contains_object(id) {
                return Err(CatalogError::ObjectExists(*id));
            }
        }

        let mut transferred: BTreeMap<ObjectId, BTreeMap<(u16, u32), Timestamp>> =
            BTreeMap::new();
        for entry in &writes.log {
            let table = state.table(entry.db_id(), entry.table_id())?;
            for merged in entry.merged() {
                let Some(obj) = table.objects.get(&merged.id()) else {
                    continue;
                };
                for ((block, row), ts) in &obj.tombstones {
                    if *ts <= self.inner.start_ts {
                        continue;
                    }
                    if let Some(moved) = entry.transfer_tombstone(&merged.id(), *block, *row, *ts)
                    {
                        transferred
                            .entry(moved.object)
                            .or_default()
                            .insert((moved.block, moved.row), moved.ts);
                    }
                }
            }
        }

        let commit_ts = state.clock.tick();
        for (db, table, id) in &writes.soft_deletes {
            if let Some(obj) = state.table_mut(*db, *table)?.objects.get_mut(id) {
                obj.lifespan.soft_delete(commit_ts);
            }
        }
        let creates = std::mem::take(&mut writes.creates);
        for (id, staged) in creates {
            let tombstones = transferred.remove(&id).unwrap_or_default();
            state.table_mut(staged.db, staged.table)?.objects.insert(
                id,
                ObjectState {
                    entry: staged.entry,
                    lifespan: Lifespan::created(commit_ts),
                    tombstones,
                },
            );
        }

        log_info!(
            component = "mem_catalog",
            event = "txn_committed",
            start_ts = self.inner.start_ts.get(),
            commit_ts = commit_ts.get(),
            soft_deleted = writes.soft_deletes.len(),
            merges = writes.log.len(),
        );
        writes.discard();
        writes.state = TxnState::Committed(commit_ts);
        Ok(commit_ts)
    }

    /// Discard the write set.
    pub fn rollback(&self) {
        let mut writes = self.inner.writes.lock();
        if writes.state == TxnState::Active {
            writes.discard();
            writes.state = TxnState::RolledBack;
            log_debug!(
                component = "mem_catalog",
                event = "txn_rolled_back",
                start_ts = self.inner.start_ts.get(),
            );
        }
    }

    /// Commit timestamp, once committed.
    pub fn commit_ts(&self) -> Option<Timestamp> {
        match self.inner.writes.lock().state {
            TxnState::Committed(ts) => Some(ts),
            _ => None,
        }
    }

    /// Merge entries logged so far.
    pub fn logged_entries(&self) -> Vec<MergeObjectsEntry> {
        self.inner.writes.lock().log.clone()
    }
}

impl fmt::Debug for MemTxn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let writes = self.inner.writes.lock();
        f.debug_struct("MemTxn")
            .field("start_ts", &self.inner.start_ts)
            .field("state", &writes.state)
            .field("soft_deletes", &writes.soft_deletes.len())
            .field("creates", &writes.creates.len())
            .finish()
    }
}

impl Transaction for MemTxn {
    fn start_ts(&self) -> Timestamp {
        self.inner.start_ts
    }

    fn database(&self, id: DatabaseId) -> Result<Arc<dyn Database>, CatalogError> {
        self.inner.writes.lock().ensure_active()?;
        if !self.inner.catalog.state.lock().databases.contains_key(&id) {
            return Err(CatalogError::DatabaseNotFound(id));
        }
        Ok(Arc::new(MemDatabase {
            txn: Arc::clone(&self.inner),
            id,
        }))
    }

    fn log_entry(
        &self,
        db: DatabaseId,
        table: TableId,
        entry: MergeObjectsEntry,
    ) -> Result<(), CatalogError> {
        let mut writes = self.inner.writes.lock();
        writes.ensure_active()?;
        if entry.db_id() != db || entry.table_id() != table {
            return Err(CatalogError::TableNotFound { db, table });
        }
        writes.log.push(entry);
        Ok(())
    }
}

struct MemDatabase {
    txn: Arc<TxnInner>,
    id: DatabaseId,
}

impl Database for MemDatabase {
    fn id(&self) -> DatabaseId {
        self.id
    }

    fn relation(&self, id: TableId) -> Result<Arc<dyn Relation>, CatalogError> {
        let schema = Arc::clone(&self.txn.catalog.state.lock().table(self.id, id)?.schema);
        Ok(Arc::new(MemRelation {
            txn: Arc::clone(&self.txn),
            db: self.id,
            table: id,
            schema,
        }))
    }
}

struct MemRelation {
    txn: Arc<TxnInner>,
    db: DatabaseId,
    table: TableId,
    schema: Arc<TableSchema>,
}

impl MemRelation {
    fn handle(&self, id: ObjectId, staged: bool, snapshot: ObjectEntry) -> Arc<dyn ObjectHandle> {
        Arc::new(MemObjectHandle {
            txn: Arc::clone(&self.txn),
            db: self.db,
            table: self.table,
            id,
            staged,
            snapshot,
            schema: Arc::clone(&self.schema),
        })
    }

    /// Entry of a committed object visible at the transaction's snapshot.
    fn committed_entry(&self, id: &ObjectId) -> Result<ObjectEntry, CatalogError> {
        let state = self.txn.catalog.state.lock();
        state
            .table(self.db, self.table)?
            .objects
            .get(id)
            .filter(|obj| obj.lifespan.visible_at(self.txn.start_ts))
            .map(|obj| obj.entry.clone())
            .ok_or(CatalogError::ObjectNotFound(*id))
    }
}

impl Relation for MemRelation {
    fn id(&self) -> TableId {
        self.table
    }

    fn schema(&self) -> Arc<TableSchema> {
        Arc::clone(&self.schema)
    }

    fn object(&self, id: &ObjectId) -> Result<Arc<dyn ObjectHandle>, CatalogError> {
        {
            let writes = self.txn.writes.lock();
            writes.ensure_active()?;
            if let Some(staged) = writes.creates.get(id) {
                return Ok(self.handle(*id, true, staged.entry.clone()));
            }
            if writes.soft_deletes.contains(&(self.db, self.table, *id)) {
                return Err(CatalogError::ObjectNotFound(*id));
            }
        }
        let entry = self.committed_entry(id)?;
        Ok(self.handle(*id, false, entry))
    }

    fn soft_delete_object(&self, id: &ObjectId) -> Result<(), CatalogError> {
        self.txn.catalog.faults.check_soft_delete(*id)?;
        self.committed_entry(id)?;
        let mut writes = self.txn.writes.lock();
        writes.ensure_active()?;
        if !writes.soft_deletes.insert((self.db, self.table, *id)) {
            return Err(CatalogError::AlreadyDeleted(*id));
        }
        Ok(())
    }

    fn create_non_appendable_object(
        &self,
        id: ObjectId,
    ) -> Result<Arc<dyn ObjectHandle>, CatalogError> {
        if self.txn.catalog.state.lock().contains_object(&id) {
            return Err(CatalogError::ObjectExists(id));
        }
        let entry = ObjectEntry::new(self.db, self.table, ObjectStats::new(id, Vec::new(), false));
        let mut writes = self.txn.writes.lock();
        writes.ensure_active()?;
        if writes.creates.contains_key(&id) {
            return Err(CatalogError::ObjectExists(id));
        }
        writes.creates.insert(
            id,
            StagedObject {
                db: self.db,
                table: self.table,
                entry: entry.clone(),
            },
        );
        Ok(self.handle(id, true, entry))
    }
}

struct MemObjectHandle {
    txn: Arc<TxnInner>,
    db: DatabaseId,
    table: TableId,
    id: ObjectId,
    staged: bool,
    snapshot: ObjectEntry,
    schema: Arc<TableSchema>,
}

impl MemObjectHandle {
    fn update_staged(&self, update: impl FnOnce(&mut ObjectEntry)) -> Result<(), CatalogError> {
        if !self.staged {
            return Err(CatalogError::Immutable(self.id));
        }
        let mut writes = self.txn.writes.lock();
        writes.ensure_active()?;
        let staged = writes
            .creates
            .get_mut(&self.id)
            .ok_or(CatalogError::ObjectNotFound(self.id))?;
        update(&mut staged.entry);
        Ok(())
    }

    fn project(
        &self,
        block: u16,
        batch: &RecordBatch,
        columns: &[usize],
    ) -> Result<RecordBatch, StorageError> {
        let data_schema = self.schema.data_schema();
        let mut fields = Vec::with_capacity(columns.len());
        let mut arrays: Vec<ArrayRef> = Vec::with_capacity(columns.len());
        for idx in columns {
            let def = self
                .schema
                .column(*idx)
                .ok_or(StorageError::UnknownColumn(*idx))?;
            if def.is_phys_addr() {
                let base = u64::from(block) << 32;
                let addrs =
                    UInt64Array::from_iter_values((0..batch.num_rows() as u64).map(|row| base | row));
                fields.push(Field::new(PHYS_ADDR_COLUMN, DataType::UInt64, false));
                arrays.push(Arc::new(addrs));
                continue;
            }
            let pos = self
                .schema
                .data_columns()
                .position(|col| col.idx() == *idx)
                .ok_or(StorageError::UnknownColumn(*idx))?;
            fields.push(data_schema.field(pos).clone());
            arrays.push(Arc::clone(batch.column(pos)));
        }
        Ok(RecordBatch::try_new(Arc::new(Schema::new(fields)), arrays)?)
    }
}

impl ObjectHandle for MemObjectHandle {
    fn entry(&self) -> ObjectEntry {
        if self.staged {
            if let Some(staged) = self.txn.writes.lock().creates.get(&self.id) {
                return staged.entry.clone();
            }
        }
        self.snapshot.clone()
    }

    fn update_stats(&self, stats: ObjectStats) -> Result<(), CatalogError> {
        if stats.id() != self.id {
            return Err(CatalogError::ObjectNotFound(stats.id()));
        }
        self.update_staged(|entry| entry.set_stats(stats))
    }

    fn set_sorted(&self) -> Result<(), CatalogError> {
        self.update_staged(ObjectEntry::set_sorted)
    }

    fn read_block<'a>(
        &'a self,
        block: u16,
        columns: &'a [usize],
        pool: &'a MergePool,
    ) -> BoxFuture<'a, Result<BlockView, StorageError>> {
        Box::pin(async move {
            let catalog = &self.txn.catalog;
            catalog.faults.check_read(self.id, block)?;
            if let Some(delay) = catalog.faults.read_delay() {
                tokio::time::sleep(delay).await;
            }
            let blocks = catalog
                .store
                .get(&self.id)
                .ok_or(StorageError::MissingObject(self.id))?;
            let batch = blocks
                .get(usize::from(block))
                .ok_or(StorageError::BlockOutOfRange {
                    object: self.id,
                    block,
                })?;
            let projected = self.project(block, batch, columns)?;

            let deletes = if self.staged {
                DeleteMask::none(batch.num_rows())
            } else {
                let state = catalog.state.lock();
                state
                    .table(self.db, self.table)
                    .ok()
                    .and_then(|table| table.objects.get(&self.id))
                    .map(|obj| obj.delete_mask(block, batch.num_rows(), self.txn.start_ts))
                    .unwrap_or_else(|| DeleteMask::none(batch.num_rows()))
            };

            let reservation = pool.try_reserve(projected.get_array_memory_size())?;
            log_debug!(
                component = "mem_catalog",
                event = "block_read",
                object = %self.id,
                block,
                rows = projected.num_rows(),
                deleted = deletes.deleted_count(),
            );
            BlockView::try_new(self.id, block, projected, deletes, reservation)
        })
    }
}
