use std::{collections::HashSet, fmt, sync::Arc, time::Duration};

use parking_lot::Mutex;

use crate::{
    catalog::{CatalogError, StorageError},
    id::ObjectId,
};

#[derive(Default)]
struct Faults {
    reads: HashSet<(ObjectId, u16)>,
    soft_deletes: HashSet<ObjectId>,
    write_budget: Option<usize>,
    writes: usize,
    read_delay: Option<Duration>,
}

/// Failure switches for the in-memory catalog, shared by every transaction
/// and writer of one [`MemCatalog`](super::MemCatalog).
#[derive(Clone, Default)]
pub struct FaultInjector {
    inner: Arc<Mutex<Faults>>,
}

impl FaultInjector {
    /// Fail every read of `block` of `object`.
    pub fn fail_read(&self, object: ObjectId, block: u16) {
        self.inner.lock().reads.insert((object, block));
    }

    /// Fail soft-deleting `object`.
    pub fn fail_soft_delete(&self, object: ObjectId) {
        self.inner.lock().soft_deletes.insert(object);
    }

    /// Let `blocks` more block writes succeed, then fail all of them.
    pub fn fail_write_after(&self, blocks: usize) {
        let mut faults = self.inner.lock();
        faults.write_budget = Some(blocks);
        faults.writes = 0;
    }

    /// Delay every block read.
    pub fn delay_reads(&self, delay: Duration) {
        self.inner.lock().read_delay = Some(delay);
    }

    /// Remove every fault.
    pub fn clear(&self) {
        *self.inner.lock() = Faults::default();
    }

    pub(crate) fn check_read(&self, object: ObjectId, block: u16) -> Result<(), StorageError> {
        if self.inner.lock().reads.contains(&(object, block)) {
            return Err(StorageError::Injected(format!(
                "read of block {block} of {object}"
            )));
        }
        Ok(())
    }

    pub(crate) fn read_delay(&self) -> Option<Duration> {
        self.inner.lock().read_delay
    }

    pub(crate) fn check_soft_delete(&self, object: ObjectId) -> Result<(), CatalogError> {
        if self.inner.lock().soft_deletes.contains(&object) {
            return Err(CatalogError::Injected(format!("soft delete of {object}")));
        }
        Ok(())
    }

    pub(crate) fn check_write(&self) -> Result<(), StorageError> {
        let mut faults = self.inner.lock();
        if let Some(budget) = faults.write_budget {
            if faults.writes >= budget {
                return Err(StorageError::Injected(format!(
                    "block write after {budget} blocks"
                )));
            }
        }
        faults.writes += 1;
        Ok(())
    }
}

impl fmt::Debug for FaultInjector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let faults = self.inner.lock();
        f.debug_struct("FaultInjector")
            .field("reads", &faults.reads.len())
            .field("soft_deletes", &faults.soft_deletes.len())
            .field("write_budget", &faults.write_budget)
            .field("read_delay", &faults.read_delay)
            .finish()
    }
}
