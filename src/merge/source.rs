//! Merge inputs.
//!
//! A run yields source blocks in order; when the table has a sort key, rows
//! are sorted across all blocks of a run. Prepared runs hand out views that
//! were read up front. Streamed runs read the next block of one object only
//! when the merge has drained the previous one, so at most one of the
//! object's views is open at a time.

use std::{collections::VecDeque, future::Future, sync::Arc};

use tokio_util::sync::CancellationToken;

use super::error::MergeError;
use crate::{block::BlockView, catalog::ObjectHandle, pool::MergePool};

/// A block together with its global offset across all merged objects.
#[derive(Debug)]
pub(crate) struct SourceBlock {
    pub(crate) offset: usize,
    pub(crate) view: BlockView,
}

pub(crate) struct StreamedObject {
    handle: Arc<dyn ObjectHandle>,
    first_offset: usize,
    next_block: usize,
    block_count: usize,
    columns: Arc<[usize]>,
    pool: MergePool,
}

pub(crate) enum MergeRun {
    Prepared(VecDeque<SourceBlock>),
    Streamed(StreamedObject),
}

impl MergeRun {
    pub(crate) fn prepared(blocks: impl IntoIterator<Item = SourceBlock>) -> Self {
        MergeRun::Prepared(blocks.into_iter().collect())
    }

    pub(crate) fn streamed(
        handle: Arc<dyn ObjectHandle>,
        first_offset: usize,
        block_count: usize,
        columns: Arc<[usize]>,
        pool: MergePool,
    ) -> Self {
        MergeRun::Streamed(StreamedObject {
            handle,
            first_offset,
            next_block: 0,
            block_count,
            columns,
            pool,
        })
    }

    pub(crate) fn is_streamed(&self) -> bool {
        matches!(self, MergeRun::Streamed(_))
    }

    /// Next block of the run, or `None` once exhausted.
    pub(crate) async fn next_block(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<Option<SourceBlock>, MergeError> {
        if cancel.is_cancelled() {
            return Err(MergeError::Cancelled);
        }
        match self {
            MergeRun::Prepared(blocks) => Ok(blocks.pop_front()),
            MergeRun::Streamed(object) => {
                if object.next_block >= object.block_count {
                    return Ok(None);
                }
                let block = u16::try_from(object.next_block)
                    .map_err(|_| MergeError::Invariant("object block offset exceeds u16"))?;
                let view = cancellable(
                    cancel,
                    object
                        .handle
                        .read_block(block, &object.columns, &object.pool),
                )
                .await??;
                if view.num_columns() != object.columns.len() {
                    return Err(MergeError::Invariant(
                        "block view column count differs from projection",
                    ));
                }
                object.next_block += 1;
                Ok(Some(SourceBlock {
                    offset: object.first_offset + usize::from(block),
                    view,
                }))
            }
        }
    }
}

/// Race `fut` against cancellation of `cancel`.
pub(crate) async fn cancellable<F, T>(cancel: &CancellationToken, fut: F) -> Result<T, MergeError>
where
    F: Future<Output = T>,
{
    if cancel.is_cancelled() {
        return Err(MergeError::Cancelled);
    }
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(MergeError::Cancelled),
        out = fut => Ok(out),
    }
}
