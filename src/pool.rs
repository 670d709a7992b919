//! Memory accounting shared by concurrent merges.
//!
//! A [`MergePool`] wraps a DataFusion [`MemoryPool`] and is handed to every
//! merge through its runtime instead of living in global state. Each merge
//! registers its own [`MemoryConsumer`] via [`MergePool::consumer`], so a
//! bounded pool names the largest merges when it refuses memory. Every block
//! view holds a [`Reservation`] for the bytes it materialized; dropping the
//! view returns them. Acquire/release counters let callers assert that every
//! view a merge acquired was released exactly once.

use std::{
    fmt,
    num::NonZeroUsize,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
};

use datafusion::execution::memory_pool::{
    GreedyMemoryPool, MemoryConsumer, MemoryPool, MemoryReservation, TrackConsumersPool,
    UnboundedMemoryPool,
};

const DEFAULT_CONSUMER: &str = "merge-pool";

/// Errors raised by the pool.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PoolError {
    /// The underlying memory pool refused the reservation.
    #[error("merge pool exhausted: requested {requested} bytes with {reserved} in use: {message}")]
    Exhausted {
        /// Bytes asked for.
        requested: usize,
        /// Bytes reserved in the pool when the request failed.
        reserved: usize,
        /// Reason reported by the memory pool.
        message: String,
    },
}

/// Point-in-time view of pool usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Bytes currently reserved.
    pub reserved: usize,
    /// Highest reservation seen.
    pub peak: usize,
    /// Reservations handed out.
    pub acquired: u64,
    /// Reservations returned.
    pub released: u64,
}

impl PoolStats {
    /// Reservations not yet returned.
    pub fn outstanding(&self) -> u64 {
        self.acquired.saturating_sub(self.released)
    }
}

#[derive(Default)]
struct Counters {
    peak: AtomicUsize,
    acquired: AtomicU64,
    released: AtomicU64,
}

/// Cloneable handle to a shared memory pool, scoped to one consumer.
#[derive(Clone)]
pub struct MergePool {
    pool: Arc<dyn MemoryPool>,
    limit: Option<usize>,
    consumer: Arc<MemoryReservation>,
    counters: Arc<Counters>,
}

impl MergePool {
    /// Pool without a byte limit; still tracks usage.
    pub fn unbounded() -> Self {
        Self::from_memory_pool(Arc::new(UnboundedMemoryPool::default()), None)
    }

    /// Pool capped at `limit` bytes. A limit of zero means unbounded.
    pub fn with_limit(limit: usize) -> Self {
        if limit == 0 {
            return Self::unbounded();
        }
        let top_consumers = NonZeroUsize::new(3).unwrap_or(NonZeroUsize::MIN);
        Self::from_memory_pool(
            Arc::new(TrackConsumersPool::new(
                GreedyMemoryPool::new(limit),
                top_consumers,
            )),
            Some(limit),
        )
    }

    /// Account against an existing memory pool, e.g. one shared with query
    /// execution. `limit` is informational only.
    pub fn from_memory_pool(pool: Arc<dyn MemoryPool>, limit: Option<usize>) -> Self {
        let consumer = Arc::new(MemoryConsumer::new(DEFAULT_CONSUMER).register(&pool));
        Self {
            pool,
            limit,
            consumer,
            counters: Arc::new(Counters::default()),
        }
    }

    /// Handle charging a new consumer `name` against the same pool and
    /// counters.
    pub fn consumer(&self, name: impl Into<String>) -> Self {
        Self {
            pool: Arc::clone(&self.pool),
            limit: self.limit,
            consumer: Arc::new(MemoryConsumer::new(name).register(&self.pool)),
            counters: Arc::clone(&self.counters),
        }
    }

    /// Reserve `bytes` for this handle's consumer, failing when the pool
    /// refuses them.
    pub fn try_reserve(&self, bytes: usize) -> Result<Reservation, PoolError> {
        let mut reservation = self.consumer.new_empty();
        reservation
            .try_grow(bytes)
            .map_err(|err| PoolError::Exhausted {
                requested: bytes,
                reserved: self.pool.reserved(),
                message: err.to_string(),
            })?;
        self.counters
            .peak
            .fetch_max(self.pool.reserved(), Ordering::Relaxed);
        self.counters.acquired.fetch_add(1, Ordering::AcqRel);
        Ok(Reservation {
            inner: reservation,
            counters: Arc::clone(&self.counters),
        })
    }

    /// Current usage and counters.
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            reserved: self.pool.reserved(),
            peak: self.counters.peak.load(Ordering::Relaxed),
            acquired: self.counters.acquired.load(Ordering::Acquire),
            released: self.counters.released.load(Ordering::Acquire),
        }
    }

    /// Configured limit, if known.
    pub fn limit(&self) -> Option<usize> {
        self.limit
    }

    /// Name of the consumer this handle charges.
    pub fn consumer_name(&self) -> &str {
        self.consumer.consumer().name()
    }
}

impl Default for MergePool {
    fn default() -> Self {
        Self::unbounded()
    }
}

impl fmt::Debug for MergePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MergePool")
            .field("consumer", &self.consumer_name())
            .field("limit", &self.limit)
            .field("stats", &self.stats())
            .finish()
    }
}

/// Bytes held against a [`MergePool`]; returned on drop.
pub struct Reservation {
    inner: MemoryReservation,
    counters: Arc<Counters>,
}

impl Reservation {
    /// Reserved size in bytes.
    pub fn size(&self) -> usize {
        self.inner.size()
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.inner.free();
        self.counters.released.fetch_add(1, Ordering::AcqRel);
    }
}

impl fmt::Debug for Reservation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reservation")
            .field("consumer", &self.inner.consumer().name())
            .field("bytes", &self.inner.size())
            .finish()
    }
}
