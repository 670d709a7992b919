//! Sort-merge-write pass.
//!
//! Runs are drained through one cursor each. With a sort key the cursors
//! feed a binary heap keyed on the row-encoded key; without one they are
//! drained back to back. Emitted rows are gathered with `interleave` into
//! blocks of at most `block_max_rows` rows and handed to a writer that is
//! opened lazily and sealed after `object_max_blocks` blocks.
//!
//! A source view, and with it its pool reservation, stays alive while its
//! cursor drains it and until the last output block gathering one of its
//! rows has been written.

use std::{
    cmp::Ordering,
    collections::{BinaryHeap, HashMap},
    sync::Arc,
};

use arrow::{
    array::{Array, RecordBatch},
    compute::interleave,
    error::ArrowError,
    row::{OwnedRow, RowConverter, Rows, SortField},
};
use tokio_util::sync::CancellationToken;

use super::{
    booking::{Booking, NewRowAddr},
    entry::MergeCommitEntry,
    error::MergeError,
    metrics::MergeSummary,
    source::{cancellable, MergeRun, SourceBlock},
    writer::{ObjectWriter, WriterFactory, WriterSpec},
};
use crate::{block::BlockView, observability::log_debug};

/// Shape of the output and where it goes.
pub(crate) struct EngineConfig<'a> {
    pub(crate) block_max_rows: usize,
    pub(crate) object_max_blocks: usize,
    pub(crate) spec: &'a WriterSpec,
    pub(crate) writers: &'a dyn WriterFactory,
}

/// Merge `runs` and write the result, appending created stats and row
/// relocations to `entry`.
pub(crate) async fn merge_runs(
    runs: Vec<MergeRun>,
    config: EngineConfig<'_>,
    entry: &mut MergeCommitEntry,
    cancel: &CancellationToken,
) -> Result<MergeSummary, MergeError> {
    if config.block_max_rows == 0 {
        return Err(MergeError::Invariant("block row cap must be positive"));
    }
    let converter = match config.spec.sort_key_pos {
        Some(pos) => {
            let field = config
                .spec
                .schema
                .fields()
                .get(pos)
                .ok_or(MergeError::Invariant("sort key outside written columns"))?;
            Some(RowConverter::new(vec![SortField::new(
                field.data_type().clone(),
            )])?)
        }
        None => None,
    };
    let keys = converter
        .as_ref()
        .zip(config.spec.sort_key_pos)
        .map(|(converter, pos)| KeyColumn { converter, pos });

    let mut cursors: Vec<Cursor> = runs.into_iter().map(Cursor::new).collect();
    let mut output = OutputState::new(&config);

    match keys {
        Some(keys) => {
            merge_sorted(&mut cursors, &keys, &mut output, entry, cancel).await?;
        }
        None => concat_unsorted(&mut cursors, &mut output, entry, cancel).await?,
    }

    output.flush_block(entry, cancel).await?;
    output.finish_object(entry, cancel).await?;
    Ok(output.summary)
}

async fn merge_sorted(
    cursors: &mut [Cursor],
    keys: &KeyColumn<'_>,
    output: &mut OutputState<'_>,
    entry: &mut MergeCommitEntry,
    cancel: &CancellationToken,
) -> Result<(), MergeError> {
    let mut heap = BinaryHeap::with_capacity(cursors.len());
    for (idx, cursor) in cursors.iter_mut().enumerate() {
        if cursor
            .load_next(Some(keys), &mut entry.booking, &mut output.summary, cancel)
            .await?
        {
            heap.push(HeapEntry {
                key: cursor.current_key()?,
                cursor: idx,
            });
        }
    }

    while let Some(HeapEntry { cursor: idx, .. }) = heap.pop() {
        let cursor = &mut cursors[idx];
        output.emit(idx, cursor, entry)?;
        if output.block_full() {
            output.flush_block(entry, cancel).await?;
        }
        cursor.step();
        let has_row = cursor.current_row().is_some()
            || cursor
                .load_next(Some(keys), &mut entry.booking, &mut output.summary, cancel)
                .await?;
        if has_row {
            heap.push(HeapEntry {
                key: cursor.current_key()?,
                cursor: idx,
            });
        }
    }
    Ok(())
}

async fn concat_unsorted(
    cursors: &mut [Cursor],
    output: &mut OutputState<'_>,
    entry: &mut MergeCommitEntry,
    cancel: &CancellationToken,
) -> Result<(), MergeError> {
    for (idx, cursor) in cursors.iter_mut().enumerate() {
        while cursor
            .load_next(None, &mut entry.booking, &mut output.summary, cancel)
            .await?
        {
            while cursor.current_row().is_some() {
                output.emit(idx, cursor, entry)?;
                if output.block_full() {
                    output.flush_block(entry, cancel).await?;
                }
                cursor.step();
            }
        }
    }
    Ok(())
}

struct KeyColumn<'a> {
    converter: &'a RowConverter,
    pos: usize,
}

impl KeyColumn<'_> {
    fn encode(&self, batch: &RecordBatch) -> Result<Rows, ArrowError> {
        let column = batch
            .columns()
            .get(self.pos)
            .ok_or_else(|| ArrowError::SchemaError(format!("no sort column at {}", self.pos)))?;
        self.converter.convert_columns(&[column.clone()])
    }
}

#[derive(Debug)]
struct HeapEntry {
    key: OwnedRow,
    cursor: usize,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.cursor == other.cursor
    }
}

impl Eq for HeapEntry {}

impl Ord for HeapEntry {
    // `BinaryHeap` is a max-heap: reverse so the smallest key, then the
    // lowest run index, pops first.
    fn cmp(&self, other: &Self) -> Ordering {
        match self.key.cmp(&other.key) {
            Ordering::Less => Ordering::Greater,
            Ordering::Greater => Ordering::Less,
            Ordering::Equal => other.cursor.cmp(&self.cursor),
        }
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// The block a cursor is currently draining.
struct LoadedBlock {
    offset: usize,
    view: Arc<BlockView>,
    // Live rows in emission order.
    order: Vec<usize>,
    pos: usize,
    keys: Option<Rows>,
}

struct Cursor {
    run: MergeRun,
    loaded: Option<LoadedBlock>,
    generation: u64,
    last_key: Option<OwnedRow>,
}

impl Cursor {
    fn new(run: MergeRun) -> Self {
        Self {
            run,
            loaded: None,
            generation: 0,
            last_key: None,
        }
    }

    fn current_row(&self) -> Option<usize> {
        let loaded = self.loaded.as_ref()?;
        loaded.order.get(loaded.pos).copied()
    }

    fn current_key(&self) -> Result<OwnedRow, MergeError> {
        let loaded = self
            .loaded
            .as_ref()
            .ok_or(MergeError::Invariant("cursor has no loaded block"))?;
        let row = loaded
            .order
            .get(loaded.pos)
            .ok_or(MergeError::Invariant("cursor is exhausted"))?;
        let keys = loaded
            .keys
            .as_ref()
            .ok_or(MergeError::Invariant("sorted merge without encoded keys"))?;
        Ok(keys.row(*row).owned())
    }

    fn step(&mut self) {
        if let Some(loaded) = self.loaded.as_mut() {
            loaded.pos += 1;
        }
    }

    /// Replace the drained block with the next block holding live rows.
    ///
    /// Every block read is sized in the booking and its tombstoned rows
    /// counted, including blocks that turn out to hold no live row. Blocks
    /// without live rows are released immediately.
    async fn load_next(
        &mut self,
        keys: Option<&KeyColumn<'_>>,
        booking: &mut Booking,
        summary: &mut MergeSummary,
        cancel: &CancellationToken,
    ) -> Result<bool, MergeError> {
        if let Some(done) = self.loaded.take() {
            if let (Some(rows), Some(last)) = (done.keys.as_ref(), done.order.last()) {
                self.last_key = Some(rows.row(*last).owned());
            }
        }

        while let Some(SourceBlock { offset, view }) = self.run.next_block(cancel).await? {
            booking.reserve_block(offset, view.num_rows());
            let mask = view.delete_mask();
            summary.rows_dropped += mask.deleted_count() as u64;
            if mask.live_count() == 0 {
                continue;
            }

            let mut order: Vec<usize> = mask.live_rows().collect();
            let encoded = match keys {
                Some(keys) => {
                    let rows = keys.encode(view.batch())?;
                    order.sort_by(|a, b| rows.row(*a).cmp(&rows.row(*b)));
                    Some(rows)
                }
                None => None,
            };

            if self.run.is_streamed() {
                if let (Some(rows), Some(last), Some(first)) =
                    (encoded.as_ref(), self.last_key.as_ref(), order.first())
                {
                    if rows.row(*first) < last.row() {
                        return Err(MergeError::Invariant(
                            "sorted object yields keys out of order",
                        ));
                    }
                }
            }

            self.generation += 1;
            self.loaded = Some(LoadedBlock {
                offset,
                view: Arc::new(view),
                order,
                pos: 0,
                keys: encoded,
            });
            return Ok(true);
        }
        Ok(false)
    }
}

/// Rows pending for the next output block and the writer of the open object.
struct OutputState<'a> {
    block_max_rows: usize,
    object_max_blocks: usize,
    spec: &'a WriterSpec,
    writers: &'a dyn WriterFactory,
    slots: Vec<Arc<BlockView>>,
    slot_of: HashMap<(usize, u64), usize>,
    pending: Vec<(usize, usize)>,
    writer: Option<Box<dyn ObjectWriter>>,
    blocks_in_object: usize,
    summary: MergeSummary,
}

impl<'a> OutputState<'a> {
    fn new(config: &EngineConfig<'a>) -> Self {
        Self {
            block_max_rows: config.block_max_rows,
            object_max_blocks: config.object_max_blocks.max(1),
            spec: config.spec,
            writers: config.writers,
            slots: Vec::new(),
            slot_of: HashMap::new(),
            pending: Vec::with_capacity(config.block_max_rows.min(8192)),
            writer: None,
            blocks_in_object: 0,
            summary: MergeSummary::default(),
        }
    }

    fn block_full(&self) -> bool {
        self.pending.len() >= self.block_max_rows
    }

    /// Queue the cursor's current row and book its destination.
    fn emit(
        &mut self,
        idx: usize,
        cursor: &Cursor,
        entry: &mut MergeCommitEntry,
    ) -> Result<(), MergeError> {
        let loaded = cursor
            .loaded
            .as_ref()
            .ok_or(MergeError::Invariant("emit without a loaded block"))?;
        let row = loaded
            .order
            .get(loaded.pos)
            .copied()
            .ok_or(MergeError::Invariant("emit past the end of a block"))?;

        let slots = &mut self.slots;
        let slot = *self
            .slot_of
            .entry((idx, cursor.generation))
            .or_insert_with(|| {
                slots.push(Arc::clone(&loaded.view));
                slots.len() - 1
            });

        let to = NewRowAddr {
            object: u32::try_from(entry.created_objects.len())
                .map_err(|_| MergeError::Invariant("too many created objects"))?,
            block: u16::try_from(self.blocks_in_object)
                .map_err(|_| MergeError::Invariant("too many blocks in object"))?,
            row: u32::try_from(self.pending.len())
                .map_err(|_| MergeError::Invariant("block row cap exceeds u32"))?,
        };
        entry.booking.record(loaded.offset, row, to);
        self.pending.push((slot, row));
        Ok(())
    }

    async fn flush_block(
        &mut self,
        entry: &mut MergeCommitEntry,
        cancel: &CancellationToken,
    ) -> Result<(), MergeError> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let block = self.build_block()?;
        let rows = block.num_rows() as u64;

        if self.writer.is_none() {
            self.writer = Some(self.writers.new_writer(self.spec)?);
        }
        let Some(writer) = self.writer.as_mut() else {
            return Err(MergeError::Invariant("output writer missing"));
        };
        cancellable(cancel, writer.write_block(block)).await??;

        self.pending.clear();
        self.slots.clear();
        self.slot_of.clear();
        self.blocks_in_object += 1;
        self.summary.blocks_written += 1;
        self.summary.rows_merged += rows;

        if self.blocks_in_object >= self.object_max_blocks {
            self.finish_object(entry, cancel).await?;
        }
        Ok(())
    }

    async fn finish_object(
        &mut self,
        entry: &mut MergeCommitEntry,
        cancel: &CancellationToken,
    ) -> Result<(), MergeError> {
        self.blocks_in_object = 0;
        let Some(writer) = self.writer.take() else {
            return Ok(());
        };
        let stats = cancellable(cancel, writer.finish()).await??;
        log_debug!(
            component = "merge_engine",
            event = "object_sealed",
            table = %entry.table_name,
            object = %stats.id(),
            blocks = stats.block_count(),
            rows = stats.rows(),
        );
        entry.created_objects.push(stats);
        self.summary.objects_created += 1;
        Ok(())
    }

    fn build_block(&self) -> Result<RecordBatch, ArrowError> {
        let schema = self.spec.schema.clone();
        let mut columns = Vec::with_capacity(schema.fields().len());
        for col in 0..schema.fields().len() {
            let arrays: Vec<&dyn Array> = self
                .slots
                .iter()
                .map(|view| view.batch().column(col).as_ref())
                .collect();
            columns.push(interleave(&arrays, &self.pending)?);
        }
        RecordBatch::try_new(schema, columns)
    }
}
