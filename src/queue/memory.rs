//! In-memory queue.
//!
//! Same ordering and idempotency rules as the SQLite backend, without
//! durability across restarts.

use std::collections::BTreeMap;
use std::sync::Mutex;

use super::{DurableQueue, PersistedId, QueuedRequest};
use crate::error::QueueError;
use crate::protocol::RequestDescriptor;

#[derive(Debug, Default)]
struct Entries {
    next_id: i64,
    pending: BTreeMap<PersistedId, RequestDescriptor>,
}

/// Volatile request queue
#[derive(Debug, Default)]
pub struct MemoryQueue {
    entries: Mutex<Entries>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DurableQueue for MemoryQueue {
    fn append(&self, request: &RequestDescriptor) -> Result<PersistedId, QueueError> {
        let mut entries = self.entries.lock().map_err(|_| QueueError::Poisoned)?;
        entries.next_id += 1;
        let id = PersistedId::new(entries.next_id);
        entries.pending.insert(id, request.clone());
        Ok(id)
    }

    fn peek_oldest(&self) -> Result<Option<QueuedRequest>, QueueError> {
        let entries = self.entries.lock().map_err(|_| QueueError::Poisoned)?;
        Ok(entries.pending.iter().next().map(|(id, request)| QueuedRequest {
            id: *id,
            request: request.clone(),
        }))
    }

    fn remove(&self, id: PersistedId) -> Result<bool, QueueError> {
        let mut entries = self.entries.lock().map_err(|_| QueueError::Poisoned)?;
        Ok(entries.pending.remove(&id).is_some())
    }

    fn count(&self) -> Result<usize, QueueError> {
        let entries = self.entries.lock().map_err(|_| QueueError::Poisoned)?;
        Ok(entries.pending.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_and_idempotent_remove() {
        let queue = MemoryQueue::new();
        let a = queue.append(&RequestDescriptor::new("http://h/?n=1".into())).unwrap();
        let b = queue.append(&RequestDescriptor::new("http://h/?n=2".into())).unwrap();

        assert_eq!(queue.peek_oldest().unwrap().unwrap().id, a);
        assert!(queue.remove(a).unwrap());
        assert!(!queue.remove(a).unwrap());
        assert_eq!(queue.peek_oldest().unwrap().unwrap().id, b);
        assert_eq!(queue.count().unwrap(), 1);
    }
}
