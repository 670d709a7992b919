//! Merge compaction: k-way merge of objects of one table into new objects,
//! published atomically through the merging transaction.

mod apply;
mod booking;
mod engine;
mod entry;
mod error;
mod log_entry;
mod metrics;
mod options;
mod source;
mod task;
mod writer;

pub use apply::handle_merge_entry_in_txn;
pub use booking::{Booking, NewRowAddr};
pub use entry::MergeCommitEntry;
pub use error::{MergeError, MergePhase};
pub use log_entry::{MergeObjectsEntry, TransferredTombstone};
pub use metrics::{MergeMetrics, MergeMetricsSnapshot, MergeSummary};
pub use options::{MergeOptions, MergeRuntime};
pub use task::{MergeObjectsTask, PreparedData};
pub use writer::{ObjectStatsBuilder, ObjectWriter, WriterFactory, WriterSpec};
