use std::{collections::HashMap, fmt, sync::Arc};

use arrow::array::RecordBatch;
use futures_util::future::BoxFuture;
use parking_lot::RwLock;

use super::faults::FaultInjector;
use crate::{
    catalog::StorageError,
    id::{ObjectId, ObjectIdGenerator},
    merge::{ObjectStatsBuilder, ObjectWriter, WriterFactory, WriterSpec},
    object::ObjectStats,
};

/// Block data of every object, keyed by object id.
///
/// Data is written once when an object is sealed and never changes
/// afterwards. Objects of rolled-back merges stay behind as orphans.
#[derive(Clone, Default)]
pub struct MemObjectStore {
    objects: Arc<RwLock<HashMap<ObjectId, Arc<[RecordBatch]>>>>,
}

impl MemObjectStore {
    pub(crate) fn put(&self, id: ObjectId, blocks: Vec<RecordBatch>) {
        self.objects.write().insert(id, blocks.into());
    }

    /// Blocks of `id`, if the object was written.
    pub fn get(&self, id: &ObjectId) -> Option<Arc<[RecordBatch]>> {
        self.objects.read().get(id).cloned()
    }

    /// Whether data exists for `id`.
    pub fn contains(&self, id: &ObjectId) -> bool {
        self.objects.read().contains_key(id)
    }

    /// Number of stored objects, orphans included.
    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    /// Whether nothing was stored yet.
    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }
}

impl fmt::Debug for MemObjectStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemObjectStore")
            .field("objects", &self.len())
            .finish()
    }
}

/// Writer factory storing sealed objects in a [`MemObjectStore`].
#[derive(Debug, Clone)]
pub struct MemWriterFactory {
    store: MemObjectStore,
    ids: Arc<ObjectIdGenerator>,
    faults: FaultInjector,
}

impl MemWriterFactory {
    pub(crate) fn new(
        store: MemObjectStore,
        ids: Arc<ObjectIdGenerator>,
        faults: FaultInjector,
    ) -> Self {
        Self { store, ids, faults }
    }
}

impl WriterFactory for MemWriterFactory {
    fn new_writer(&self, spec: &WriterSpec) -> Result<Box<dyn ObjectWriter>, StorageError> {
        let id = self.ids.generate()?;
        Ok(Box::new(MemObjectWriter {
            id,
            stats: ObjectStatsBuilder::new(id, spec)?,
            blocks: Vec::new(),
            store: self.store.clone(),
            faults: self.faults.clone(),
        }))
    }
}

struct MemObjectWriter {
    id: ObjectId,
    stats: ObjectStatsBuilder,
    blocks: Vec<RecordBatch>,
    store: MemObjectStore,
    faults: FaultInjector,
}

impl ObjectWriter for MemObjectWriter {
    fn id(&self) -> ObjectId {
        self.id
    }

    fn write_block(&mut self, block: RecordBatch) -> BoxFuture<'_, Result<(), StorageError>> {
        Box::pin(async move {
            self.faults.check_write()?;
            self.stats.observe_block(&block)?;
            self.blocks.push(block);
            Ok(())
        })
    }

    fn finish(self: Box<Self>) -> BoxFuture<'static, Result<ObjectStats, StorageError>> {
        Box::pin(async move {
            let MemObjectWriter {
                id,
                stats,
                blocks,
                store,
                ..
            } = *self;
            if blocks.is_empty() {
                return Err(StorageError::Writer("object sealed without blocks"));
            }
            store.put(id, blocks);
            Ok(stats.finish())
        })
    }
}
