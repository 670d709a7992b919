//! Block views: the projected columns of one block plus its tombstones.

use std::fmt;

use arrow::{
    array::{BooleanArray, BooleanBufferBuilder, RecordBatch},
    buffer::BooleanBuffer,
};

use crate::{catalog::StorageError, id::ObjectId, pool::Reservation};

/// Tombstone bitmap of a block; a set bit marks a logically deleted row.
#[derive(Clone, PartialEq, Eq)]
pub struct DeleteMask {
    bits: BooleanBuffer,
}

impl DeleteMask {
    /// Mask for `len` rows with nothing deleted.
    pub fn none(len: usize) -> Self {
        Self {
            bits: BooleanBuffer::new_unset(len),
        }
    }

    /// Mask for `len` rows with `deleted` rows set. Out-of-range rows are ignored.
    pub fn from_deleted<I>(len: usize, deleted: I) -> Self
    where
        I: IntoIterator<Item = usize>,
    {
        let mut builder = BooleanBufferBuilder::new(len);
        builder.append_n(len, false);
        for row in deleted {
            if row < len {
                builder.set_bit(row, true);
            }
        }
        Self {
            bits: builder.finish(),
        }
    }

    /// Wrap an existing bitmap.
    pub fn from_buffer(bits: BooleanBuffer) -> Self {
        Self { bits }
    }

    /// Rows covered by the mask.
    pub fn len(&self) -> usize {
        self.bits.len()
    }

    /// Whether the mask covers no rows.
    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    /// Whether `row` is tombstoned.
    pub fn is_deleted(&self, row: usize) -> bool {
        row < self.bits.len() && self.bits.value(row)
    }

    /// Number of tombstoned rows.
    pub fn deleted_count(&self) -> usize {
        self.bits.count_set_bits()
    }

    /// Number of visible rows.
    pub fn live_count(&self) -> usize {
        self.bits.len() - self.deleted_count()
    }

    /// Indices of visible rows in ascending order.
    pub fn live_rows(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.bits.len()).filter(|row| !self.bits.value(*row))
    }

    /// Filter predicate selecting visible rows.
    pub fn live_filter(&self) -> BooleanArray {
        BooleanArray::new(!&self.bits, None)
    }

    /// Underlying bitmap.
    pub fn as_buffer(&self) -> &BooleanBuffer {
        &self.bits
    }
}

impl fmt::Debug for DeleteMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeleteMask")
            .field("rows", &self.len())
            .field("deleted", &self.deleted_count())
            .finish()
    }
}

/// Read-only projection of one block, owned by the reader that acquired it.
///
/// The view holds a pool reservation for the bytes it materialized. Dropping
/// the view releases it; there is no other release path, so a view is
/// released exactly once however the owning operation ends.
pub struct BlockView {
    object: ObjectId,
    block: u16,
    batch: RecordBatch,
    deletes: DeleteMask,
    _reservation: Reservation,
}

impl BlockView {
    /// Assemble a view; the mask must cover every row of `batch`.
    pub fn try_new(
        object: ObjectId,
        block: u16,
        batch: RecordBatch,
        deletes: DeleteMask,
        reservation: Reservation,
    ) -> Result<Self, StorageError> {
        if deletes.len() != batch.num_rows() {
            return Err(StorageError::MaskLength {
                rows: batch.num_rows(),
                mask: deletes.len(),
            });
        }
        Ok(Self {
            object,
            block,
            batch,
            deletes,
            _reservation: reservation,
        })
    }

    /// Object the block belongs to.
    pub fn object(&self) -> ObjectId {
        self.object
    }

    /// Block offset within its object.
    pub fn block(&self) -> u16 {
        self.block
    }

    /// Projected columns.
    pub fn batch(&self) -> &RecordBatch {
        &self.batch
    }

    /// Tombstones visible to the reading snapshot.
    pub fn delete_mask(&self) -> &DeleteMask {
        &self.deletes
    }

    /// Rows in the block, tombstoned or not.
    pub fn num_rows(&self) -> usize {
        self.batch.num_rows()
    }

    /// Number of projected columns.
    pub fn num_columns(&self) -> usize {
        self.batch.num_columns()
    }
}

impl fmt::Debug for BlockView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockView")
            .field("object", &self.object)
            .field("block", &self.block)
            .field("rows", &self.batch.num_rows())
            .field("deletes", &self.deletes)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use arrow::{
        array::{Int64Array, RecordBatch},
        datatypes::{DataType, Field, Schema},
    };

    use super::*;
    use crate::{id::ObjectIdGenerator, pool::MergePool};

    #[test]
    fn mask_reports_live_rows() {
        let mask = DeleteMask::from_deleted(5, [1, 3, 9]);
        assert_eq!(mask.len(), 5);
        assert_eq!(mask.deleted_count(), 2);
        assert_eq!(mask.live_count(), 3);
        assert_eq!(mask.live_rows().collect::<Vec<_>>(), vec![0, 2, 4]);
        let filter = mask.live_filter();
        assert!(filter.value(0));
        assert!(!filter.value(1));
        assert!(!mask.is_deleted(9));
    }

    #[test]
    fn view_rejects_mismatched_mask_and_releases() {
        let pool = MergePool::unbounded();
        let schema = Arc::new(Schema::new(vec![Field::new("k", DataType::Int64, false)]));
        let batch = RecordBatch::try_new(schema, vec![Arc::new(Int64Array::from(vec![1, 2]))])
            .expect("batch");
        let id = ObjectIdGenerator::default().generate().unwrap();
        let reservation = pool.try_reserve(16).expect("reserve");
        let err = BlockView::try_new(id, 0, batch.clone(), DeleteMask::none(3), reservation)
            .expect_err("mask mismatch");
        assert!(matches!(err, StorageError::MaskLength { rows: 2, mask: 3 }));
        assert_eq!(pool.stats().outstanding(), 0);

        let view = BlockView::try_new(
            id,
            0,
            batch,
            DeleteMask::none(2),
            pool.try_reserve(16).expect("reserve"),
        )
        .expect("view");
        assert_eq!(pool.stats().outstanding(), 1);
        drop(view);
        assert_eq!(pool.stats().outstanding(), 0);
    }
}
