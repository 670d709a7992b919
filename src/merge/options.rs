use std::{fmt, sync::Arc};

use super::{metrics::MergeMetrics, writer::WriterFactory};
use crate::pool::MergePool;

const DEFAULT_READ_CONCURRENCY: usize = 4;
const DEFAULT_OBJECT_MAX_BLOCKS: usize = 256;

/// Tuning knobs of merge tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeOptions {
    read_concurrency: usize,
    object_max_blocks: usize,
    pipelined: bool,
}

impl Default for MergeOptions {
    fn default() -> Self {
        Self {
            read_concurrency: DEFAULT_READ_CONCURRENCY,
            object_max_blocks: DEFAULT_OBJECT_MAX_BLOCKS,
            pipelined: true,
        }
    }
}

impl MergeOptions {
    /// Number of block reads kept in flight while preparing data.
    pub fn with_read_concurrency(mut self, reads: usize) -> Self {
        self.read_concurrency = reads.max(1);
        self
    }

    /// Cap the number of blocks in one created object.
    pub fn with_object_max_blocks(mut self, blocks: usize) -> Self {
        self.object_max_blocks = blocks.clamp(1, usize::from(u16::MAX));
        self
    }

    /// Stream sorted source objects block by block instead of reading every
    /// block before the merge starts.
    pub fn pipelined(mut self, pipelined: bool) -> Self {
        self.pipelined = pipelined;
        self
    }

    /// Block reads kept in flight.
    pub fn read_concurrency(&self) -> usize {
        self.read_concurrency
    }

    /// Maximum blocks per created object.
    pub fn object_max_blocks(&self) -> usize {
        self.object_max_blocks
    }

    /// Whether execution streams source objects.
    pub fn is_pipelined(&self) -> bool {
        self.pipelined
    }
}

/// Shared runtime handed to every merge task: memory pool, writer factory,
/// options and counters.
#[derive(Clone)]
pub struct MergeRuntime {
    pool: MergePool,
    writers: Arc<dyn WriterFactory>,
    options: MergeOptions,
    metrics: Arc<MergeMetrics>,
}

impl MergeRuntime {
    /// Runtime with default options and fresh metrics.
    pub fn new(pool: MergePool, writers: Arc<dyn WriterFactory>) -> Self {
        Self {
            pool,
            writers,
            options: MergeOptions::default(),
            metrics: Arc::new(MergeMetrics::default()),
        }
    }

    /// Replace the options.
    pub fn with_options(mut self, options: MergeOptions) -> Self {
        self.options = options;
        self
    }

    /// Share counters with other runtimes.
    pub fn with_metrics(mut self, metrics: Arc<MergeMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Memory pool views are reserved against.
    pub fn pool(&self) -> &MergePool {
        &self.pool
    }

    /// Factory creating output writers.
    pub fn writers(&self) -> &Arc<dyn WriterFactory> {
        &self.writers
    }

    /// Active options.
    pub fn options(&self) -> &MergeOptions {
        &self.options
    }

    /// Merge counters.
    pub fn metrics(&self) -> &Arc<MergeMetrics> {
        &self.metrics
    }
}

impl fmt::Debug for MergeRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MergeRuntime")
            .field("pool", &self.pool)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}
