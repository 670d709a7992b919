//! Commit timestamps and the visibility rules the merge path relies on.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Logical commit timestamp. Transactions read at their start timestamp and
/// publish at a commit timestamp allocated from a [`CommitClock`].
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Least possible timestamp.
    pub const MIN: Self = Self(0);
    /// Greatest possible timestamp.
    pub const MAX: Self = Self(u64::MAX);

    /// Construct a timestamp from a raw `u64`.
    #[inline]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw value backing this timestamp.
    #[inline]
    pub const fn get(self) -> u64 {
        self.0
    }

    /// The timestamp after `self`, saturating on overflow.
    #[inline]
    pub const fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl From<u64> for Timestamp {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ts:{}", self.0)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Hands out monotonically increasing commit timestamps.
#[derive(Debug, Clone, Copy)]
pub struct CommitClock {
    last: Timestamp,
}

impl CommitClock {
    /// Clock whose first allocation is `start.next()`.
    pub const fn new(start: Timestamp) -> Self {
        Self { last: start }
    }

    /// Allocate the next commit timestamp.
    pub fn tick(&mut self) -> Timestamp {
        self.last = self.last.next();
        self.last
    }

    /// Latest allocated timestamp; new snapshots read at this point.
    pub const fn now(&self) -> Timestamp {
        self.last
    }
}

impl Default for CommitClock {
    fn default() -> Self {
        Self::new(Timestamp::MIN)
    }
}

/// Lifetime of a catalog object in commit time.
///
/// An object is visible to a snapshot at `ts` when it was created at or
/// before `ts` and not soft-deleted at or before `ts`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lifespan {
    created_at: Timestamp,
    deleted_at: Option<Timestamp>,
}

impl Lifespan {
    /// Object created at `created_at`, still live.
    pub const fn created(created_at: Timestamp) -> Self {
        Self {
            created_at,
            deleted_at: None,
        }
    }

    /// Commit timestamp that made the object visible.
    pub const fn created_at(&self) -> Timestamp {
        self.created_at
    }

    /// Commit timestamp of the soft delete, if any.
    pub const fn deleted_at(&self) -> Option<Timestamp> {
        self.deleted_at
    }

    /// Record the soft delete.
    pub fn soft_delete(&mut self, at: Timestamp) {
        self.deleted_at = Some(at);
    }

    /// Snapshot visibility at `ts`.
    pub fn visible_at(&self, ts: Timestamp) -> bool {
        self.created_at <= ts && self.deleted_at.map_or(true, |deleted| deleted > ts)
    }
}
