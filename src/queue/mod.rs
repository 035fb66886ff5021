//! # Durable Queue Module
//!
//! Ordered, persistent store of requests still owed to the server.
//!
//! This module handles:
//! - The queue contract shared by all backends
//! - A SQLite backend that survives process restarts
//! - An in-memory backend for ephemeral sessions and tests
//!
//! An entry exists from the moment its append commits until it is removed
//! after a confirmed delivery. Nothing else deletes entries.

pub mod memory;
pub mod sqlite;

pub use memory::MemoryQueue;
pub use sqlite::SqliteQueue;

use std::fmt;

use crate::error::QueueError;
use crate::protocol::RequestDescriptor;

/// Identity assigned to a queued request on append
///
/// Ids increase monotonically with insertion order and are never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PersistedId(i64);

impl PersistedId {
    pub fn new(raw: i64) -> Self {
        Self(raw)
    }

    pub fn get(self) -> i64 {
        self.0
    }
}

impl fmt::Display for PersistedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Queue head as returned by [`DurableQueue::peek_oldest`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedRequest {
    pub id: PersistedId,
    pub request: RequestDescriptor,
}

/// Trait for durable request queue operations
///
/// Every method is one atomic operation; implementations serialize writers.
pub trait DurableQueue: Send + Sync {
    /// Store a request, returning only after the write is durable
    fn append(&self, request: &RequestDescriptor) -> Result<PersistedId, QueueError>;

    /// Oldest request not yet removed
    fn peek_oldest(&self) -> Result<Option<QueuedRequest>, QueueError>;

    /// Delete a request
    ///
    /// Idempotent: returns `Ok(false)` when the id is already gone.
    fn remove(&self, id: PersistedId) -> Result<bool, QueueError>;

    /// Number of requests still owed
    fn count(&self) -> Result<usize, QueueError>;
}

#[cfg(test)]
pub mod mocks {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Queue that fails on demand
    ///
    /// Backed by a [`MemoryQueue`]; counts reads of the head so tests can
    /// tell whether a consumer was woken.
    #[derive(Debug, Default)]
    pub struct FailingQueue {
        inner: MemoryQueue,
        fail_appends: bool,
        fail_reads: bool,
        peeks: AtomicUsize,
    }

    impl FailingQueue {
        /// Every operation fails
        pub fn broken() -> Self {
            Self {
                fail_appends: true,
                fail_reads: true,
                ..Self::default()
            }
        }

        /// Appends fail, reads and removals work on an empty queue
        pub fn rejecting_appends() -> Self {
            Self {
                fail_appends: true,
                ..Self::default()
            }
        }

        pub fn peeks(&self) -> usize {
            self.peeks.load(Ordering::SeqCst)
        }
    }

    impl DurableQueue for FailingQueue {
        fn append(&self, request: &RequestDescriptor) -> Result<PersistedId, QueueError> {
            if self.fail_appends {
                return Err(QueueError::Poisoned);
            }
            self.inner.append(request)
        }

        fn peek_oldest(&self) -> Result<Option<QueuedRequest>, QueueError> {
            self.peeks.fetch_add(1, Ordering::SeqCst);
            if self.fail_reads {
                return Err(QueueError::Poisoned);
            }
            self.inner.peek_oldest()
        }

        fn remove(&self, id: PersistedId) -> Result<bool, QueueError> {
            if self.fail_reads {
                return Err(QueueError::Poisoned);
            }
            self.inner.remove(id)
        }

        fn count(&self) -> Result<usize, QueueError> {
            if self.fail_reads {
                return Err(QueueError::Poisoned);
            }
            self.inner.count()
        }
    }
}
