use std::fmt;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use ulid::{Generator, Ulid};

/// Content identifier of an immutable storage object.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectId(Ulid);

impl ObjectId {
    /// Wrap an existing ULID.
    pub const fn from_ulid(ulid: Ulid) -> Self {
        Self(ulid)
    }

    /// Underlying ULID.
    pub const fn ulid(&self) -> Ulid {
        self.0
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "obj:{}", self.0)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// No strictly larger id can be produced in the current millisecond.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("object id space exhausted for the current millisecond")]
pub struct IdExhausted;

/// Thread-safe ULID generator; ids from one generator are strictly increasing.
pub struct ObjectIdGenerator {
    inner: Mutex<Generator>,
}

impl ObjectIdGenerator {
    /// Create a new generator seeded with the current time.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Generator::new()),
        }
    }

    /// Produce the next [`ObjectId`].
    ///
    /// Fails once the random component overflows within a single
    /// millisecond; the generator recovers on the next millisecond.
    pub fn generate(&self) -> Result<ObjectId, IdExhausted> {
        let mut guard = self.inner.lock();
        guard.generate().map(ObjectId).map_err(|_| IdExhausted)
    }
}

impl Default for ObjectIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ObjectIdGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectIdGenerator").finish_non_exhaustive()
    }
}

macro_rules! catalog_id {
    ($(#[$doc:meta])* $name:ident, $prefix:literal) => {
        $(#[$doc])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(u64);

        impl $name {
            /// Wrap a raw catalog identifier.
            pub const fn new(raw: u64) -> Self {
                Self(raw)
            }

            /// Raw identifier value.
            pub const fn get(self) -> u64 {
                self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, ":{}"), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

catalog_id!(
    /// Catalog identifier of a database.
    DatabaseId,
    "db"
);
catalog_id!(
    /// Catalog identifier of a table, unique within its database.
    TableId,
    "tbl"
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_ordered() {
        let ids = ObjectIdGenerator::default();
        let a = ids.generate().unwrap();
        let b = ids.generate().unwrap();
        assert!(a < b);
        assert_ne!(a, b);
    }

    #[test]
    fn burst_stays_strictly_increasing() {
        let ids = ObjectIdGenerator::new();
        let mut last = ids.generate().unwrap();
        for _ in 0..10_000 {
            let next = ids.generate().unwrap();
            assert!(next > last);
            last = next;
        }
    }
}
