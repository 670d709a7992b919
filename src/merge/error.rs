use std::fmt;

use arrow::error::ArrowError;
use thiserror::Error;

use crate::catalog::{CatalogError, StorageError};

/// Errors surfaced by a merge task. Every error is terminal for the task;
/// retrying is up to the scheduler.
#[derive(Debug, Error)]
pub enum MergeError {
    /// The task was constructed without source objects.
    #[error("merge task requires at least one source object")]
    EmptySources,
    /// Source objects belong to different tables.
    #[error("merge sources span more than one table")]
    MixedTables,
    /// Catalog lookup or mutation failed.
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    /// Reading or writing object data failed.
    #[error(transparent)]
    Storage(#[from] StorageError),
    /// Arrow kernel failed while merging.
    #[error("merge arrow error: {0}")]
    Arrow(#[from] ArrowError),
    /// The enclosing context cancelled the task.
    #[error("merge task cancelled")]
    Cancelled,
    /// Input or output broke an invariant the merge relies on.
    #[error("merge invariant violated: {0}")]
    Invariant(&'static str),
}

impl MergeError {
    /// `true` when the task stopped because it was asked to, rather than failing.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, MergeError::Cancelled)
    }
}

/// Phases of a merge task, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergePhase {
    /// Resolving and reading source blocks.
    PrepareData,
    /// Sort-merge and writing of new objects.
    MergeAndWrite,
    /// Publishing the merge in the catalog.
    ApplyInTxn,
}

impl fmt::Display for MergePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let desc = match self {
            MergePhase::PrepareData => "1-PrepareData",
            MergePhase::MergeAndWrite => "2-MergeAndWrite",
            MergePhase::ApplyInTxn => "3-ApplyInTxn",
        };
        f.write_str(desc)
    }
}
