//! Merge task orchestration.
//!
//! A task merges a fixed set of objects of one table inside one transaction.
//! It runs three phases strictly in sequence: source blocks are prepared,
//! merged and written to new objects, then the swap is published in the
//! transaction. Views are released on every exit path because each view owns
//! its pool reservation.

use std::sync::Arc;

use arrow::array::RecordBatch;
use futures_util::{stream, StreamExt, TryStreamExt};
use tokio_util::sync::CancellationToken;

use super::{
    apply::handle_merge_entry_in_txn,
    booking::Booking,
    engine::{merge_runs, EngineConfig},
    entry::MergeCommitEntry,
    error::{MergeError, MergePhase},
    metrics::MergeSummary,
    options::MergeRuntime,
    source::{cancellable, MergeRun, SourceBlock},
    writer::WriterSpec,
};
use crate::{
    block::{BlockView, DeleteMask},
    catalog::{ObjectHandle, Relation, Transaction},
    id::{DatabaseId, TableId},
    object::{ObjectEntry, ObjectStats},
    observability::{log_debug, log_error, log_info, log_warn},
    pool::MergePool,
    schema::TableSchema,
};

/// Block views of every source block, in global block-offset order.
///
/// Dropping the value, or calling [`PreparedData::release`], releases every
/// view exactly once.
#[derive(Debug)]
pub struct PreparedData {
    views: Vec<BlockView>,
}

impl PreparedData {
    /// Number of prepared blocks.
    pub fn len(&self) -> usize {
        self.views.len()
    }

    /// Whether no block was prepared.
    pub fn is_empty(&self) -> bool {
        self.views.is_empty()
    }

    /// Projected columns per block.
    pub fn batches(&self) -> impl Iterator<Item = &RecordBatch> + '_ {
        self.views.iter().map(BlockView::batch)
    }

    /// Tombstones per block.
    pub fn delete_masks(&self) -> impl Iterator<Item = &DeleteMask> + '_ {
        self.views.iter().map(BlockView::delete_mask)
    }

    /// The views themselves.
    pub fn views(&self) -> &[BlockView] {
        &self.views
    }

    /// Release every view now.
    pub fn release(self) {
        drop(self.views);
    }

    fn into_runs(self) -> Vec<MergeRun> {
        self.views
            .into_iter()
            .enumerate()
            .map(|(offset, view)| MergeRun::prepared([SourceBlock { offset, view }]))
            .collect()
    }
}

/// Merges a set of objects of one table into new objects.
pub struct MergeObjectsTask {
    txn: Arc<dyn Transaction>,
    runtime: MergeRuntime,
    memory: MergePool,
    db_id: DatabaseId,
    table_id: TableId,
    schema: Arc<TableSchema>,
    merged: Vec<ObjectEntry>,
    handles: Vec<Arc<dyn ObjectHandle>>,
    block_offsets: Vec<usize>,
    total_blocks: usize,
    name: String,
    cancel: CancellationToken,
    commit_entry: Option<MergeCommitEntry>,
    created: Vec<ObjectEntry>,
    failed_phase: Option<MergePhase>,
}

impl MergeObjectsTask {
    /// Resolve the table and the handles of `merged_objs` under `txn`.
    pub fn new(
        txn: Arc<dyn Transaction>,
        merged_objs: Vec<ObjectEntry>,
        runtime: MergeRuntime,
    ) -> Result<Self, MergeError> {
        let first = merged_objs.first().ok_or(MergeError::EmptySources)?;
        let (db_id, table_id) = (first.db_id(), first.table_id());
        if merged_objs
            .iter()
            .any(|obj| obj.db_id() != db_id || obj.table_id() != table_id)
        {
            return Err(MergeError::MixedTables);
        }

        let relation: Arc<dyn Relation> = txn.database(db_id)?.relation(table_id)?;
        let handles = merged_objs
            .iter()
            .map(|obj| relation.object(&obj.id()))
            .collect::<Result<Vec<_>, _>>()?;

        let mut block_offsets = Vec::with_capacity(merged_objs.len());
        let mut total_blocks = 0;
        for obj in &merged_objs {
            block_offsets.push(total_blocks);
            total_blocks += obj.block_count();
        }

        let schema = relation.schema();
        let name = format!(
            "merge-objects[{}.{}/{} x{}]",
            db_id,
            table_id,
            schema.name(),
            merged_objs.len()
        );

        let memory = runtime.pool().consumer(name.as_str());

        Ok(Self {
            txn,
            runtime,
            memory,
            db_id,
            table_id,
            schema,
            merged: merged_objs,
            handles,
            block_offsets,
            total_blocks,
            name,
            cancel: CancellationToken::new(),
            commit_entry: None,
            created: Vec::new(),
            failed_phase: None,
        })
    }

    /// Stop the task when `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Name used in log events.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Pool handle charged for this task's block views.
    pub fn memory(&self) -> &MergePool {
        &self.memory
    }

    /// Blocks across all source objects.
    pub fn total_blocks(&self) -> usize {
        self.total_blocks
    }

    /// Objects created by a successful [`execute`](Self::execute).
    pub fn created_objects(&self) -> &[ObjectEntry] {
        &self.created
    }

    /// Phase the last run failed in, if it failed.
    pub fn failed_phase(&self) -> Option<MergePhase> {
        self.failed_phase
    }

    /// Commit entry assembled by the last merge pass.
    pub fn commit_entry(&self) -> Option<&MergeCommitEntry> {
        self.commit_entry.as_ref()
    }

    /// Read every source block with all data columns and its tombstones.
    pub async fn prepare_data(&self) -> Result<PreparedData, MergeError> {
        let targets = (0..self.merged.len())
            .flat_map(|idx| self.object_blocks(idx))
            .collect::<Vec<_>>();
        let blocks = self.read_blocks(targets).await?;
        Ok(PreparedData {
            views: blocks.into_iter().map(|block| block.view).collect(),
        })
    }

    /// Empty commit entry carrying the table identity, snapshot and sources.
    pub fn prepare_commit_entry(&self) -> MergeCommitEntry {
        MergeCommitEntry {
            db_id: self.db_id,
            table_id: self.table_id,
            table_name: self.schema.name().to_owned(),
            start_ts: self.txn.start_ts(),
            merged_objects: self.merged.iter().map(|obj| obj.stats().clone()).collect(),
            created_objects: Vec::new(),
            booking: Booking::with_source_blocks(self.total_blocks),
        }
    }

    /// Parameters the output writers are created with.
    pub fn writer_spec(&self) -> WriterSpec {
        WriterSpec::for_table(&self.schema)
    }

    /// Merge prepared blocks and write the new objects. The commit entry is
    /// kept for [`apply_in_txn`](Self::apply_in_txn).
    pub async fn merge_and_write(
        &mut self,
        prepared: PreparedData,
    ) -> Result<Vec<ObjectStats>, MergeError> {
        let (entry, _) = self.merge(prepared.into_runs()).await?;
        let created = entry.created_objects.clone();
        self.commit_entry = Some(entry);
        Ok(created)
    }

    /// Publish the last merge pass in the transaction.
    pub fn apply_in_txn(&mut self) -> Result<&[ObjectEntry], MergeError> {
        let entry = self
            .commit_entry
            .as_ref()
            .ok_or(MergeError::Invariant("apply before merge"))?;
        self.created = handle_merge_entry_in_txn(self.txn.as_ref(), entry)?;
        Ok(&self.created)
    }

    /// Run all phases.
    pub async fn execute(&mut self) -> Result<(), MergeError> {
        self.failed_phase = None;
        log_debug!(
            component = "merge_task",
            event = "merge_start",
            task = %self.name,
            objects = self.merged.len(),
            blocks = self.total_blocks,
            pipelined = self.runtime.options().is_pipelined(),
        );
        match self.run_phases().await {
            Ok(summary) => {
                self.runtime.metrics().record_success(&summary);
                log_info!(
                    component = "merge_task",
                    event = "merge_done",
                    task = %self.name,
                    created = self.created.len(),
                    rows_merged = summary.rows_merged,
                    rows_dropped = summary.rows_dropped,
                    blocks_written = summary.blocks_written,
                );
                Ok(())
            }
            Err(err) => {
                self.runtime.metrics().record_failure(err.is_cancelled());
                let phase = self
                    .failed_phase
                    .map(|phase| phase.to_string())
                    .unwrap_or_default();
                if err.is_cancelled() {
                    log_warn!(
                        component = "merge_task",
                        event = "merge_cancelled",
                        task = %self.name,
                        phase = %phase,
                    );
                } else {
                    log_error!(
                        component = "merge_task",
                        event = "merge_failed",
                        task = %self.name,
                        phase = %phase,
                        error = %err,
                    );
                }
                Err(err)
            }
        }
    }

    async fn run_phases(&mut self) -> Result<MergeSummary, MergeError> {
        let runs = match self.plan_runs().await {
            Ok(runs) => runs,
            Err(err) => return Err(self.fail(MergePhase::PrepareData, err)),
        };

        let (entry, summary) = match self.merge(runs).await {
            Ok(merged) => merged,
            Err(err) => return Err(self.fail(MergePhase::MergeAndWrite, err)),
        };
        self.commit_entry = Some(entry);

        if self.cancel.is_cancelled() {
            return Err(self.fail(MergePhase::ApplyInTxn, MergeError::Cancelled));
        }
        if let Err(err) = self.apply_in_txn() {
            return Err(self.fail(MergePhase::ApplyInTxn, err));
        }
        Ok(summary)
    }

    fn fail(&mut self, phase: MergePhase, err: MergeError) -> MergeError {
        self.failed_phase = Some(phase);
        err
    }

    /// Runs for the merge pass.
    ///
    /// Pipelined: an object is streamed block by block when its rows are
    /// already in merge order, i.e. the table has no sort key or the object
    /// is sorted. Other objects have their blocks read up front, one run per
    /// block. Otherwise every block is prepared up front.
    async fn plan_runs(&self) -> Result<Vec<MergeRun>, MergeError> {
        if !self.runtime.options().is_pipelined() {
            return Ok(self.prepare_data().await?.into_runs());
        }

        let has_sort_key = self.schema.sort_key_pos().is_some();
        let streamed = |idx: usize| !has_sort_key || self.merged[idx].is_sorted();

        let eager_targets = (0..self.merged.len())
            .filter(|idx| !streamed(*idx))
            .flat_map(|idx| self.object_blocks(idx))
            .collect::<Vec<_>>();
        let mut eager = self.read_blocks(eager_targets).await?.into_iter();

        let columns: Arc<[usize]> = self.schema.data_column_indices().into();
        let mut runs = Vec::with_capacity(self.merged.len());
        for (idx, obj) in self.merged.iter().enumerate() {
            if streamed(idx) {
                runs.push(MergeRun::streamed(
                    Arc::clone(&self.handles[idx]),
                    self.block_offsets[idx],
                    obj.block_count(),
                    Arc::clone(&columns),
                    self.memory.clone(),
                ));
            } else {
                for _ in 0..obj.block_count() {
                    let block = eager
                        .next()
                        .ok_or(MergeError::Invariant("eager read returned too few blocks"))?;
                    runs.push(MergeRun::prepared([block]));
                }
            }
        }
        Ok(runs)
    }

    async fn merge(
        &self,
        runs: Vec<MergeRun>,
    ) -> Result<(MergeCommitEntry, MergeSummary), MergeError> {
        let mut entry = self.prepare_commit_entry();
        let spec = self.writer_spec();
        let config = EngineConfig {
            block_max_rows: self.schema.block_max_rows() as usize,
            object_max_blocks: self.runtime.options().object_max_blocks(),
            spec: &spec,
            writers: self.runtime.writers().as_ref(),
        };
        let summary = merge_runs(runs, config, &mut entry, &self.cancel).await?;
        Ok((entry, summary))
    }

    fn object_blocks(&self, idx: usize) -> impl Iterator<Item = (usize, usize)> + '_ {
        let first = self.block_offsets[idx];
        (0..self.merged[idx].block_count()).map(move |block| (idx, first + block))
    }

    /// Read `(object index, global offset)` targets with bounded parallelism,
    /// preserving target order. On failure every view read so far is dropped
    /// before the error is returned.
    async fn read_blocks(
        &self,
        targets: Vec<(usize, usize)>,
    ) -> Result<Vec<SourceBlock>, MergeError> {
        if targets.is_empty() {
            return Ok(Vec::new());
        }
        let columns: Arc<[usize]> = self.schema.data_column_indices().into();
        let reads = stream::iter(targets)
            .map(|(idx, offset)| {
                read_source_block(
                    Arc::clone(&self.handles[idx]),
                    offset,
                    offset - self.block_offsets[idx],
                    Arc::clone(&columns),
                    self.memory.clone(),
                )
            })
            .buffered(self.runtime.options().read_concurrency())
            .try_collect::<Vec<_>>();
        cancellable(&self.cancel, reads).await?
    }
}

async fn read_source_block(
    handle: Arc<dyn ObjectHandle>,
    offset: usize,
    block: usize,
    columns: Arc<[usize]>,
    pool: MergePool,
) -> Result<SourceBlock, MergeError> {
    let block =
        u16::try_from(block).map_err(|_| MergeError::Invariant("object block offset exceeds u16"))?;
    let view = handle.read_block(block, &columns, &pool).await?;
    if view.num_columns() != columns.len() {
        return Err(MergeError::Invariant(
            "block view column count differs from projection",
        ));
    }
    Ok(SourceBlock { offset, view })
}

impl std::fmt::Debug for MergeObjectsTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MergeObjectsTask")
            .field("name", &self.name)
            .field("objects", &self.merged.len())
            .field("blocks", &self.total_blocks)
            .field("failed_phase", &self.failed_phase)
            .finish_non_exhaustive()
    }
}
