//! # Status Events
//!
//! One-way status notifications for UI and notification layers.
//!
//! Events go out on a broadcast channel. Emitting never blocks and never
//! fails: with no subscribers, or with a lagging subscriber, events are
//! simply dropped for that subscriber.

use std::time::Duration;

use tokio::sync::broadcast;

use crate::error::{FormatError, SensorError};
use crate::queue::PersistedId;

/// Default number of events buffered per subscriber
pub const DEFAULT_STATUS_CAPACITY: usize = 64;

/// Status notification
#[derive(Debug, Clone, PartialEq)]
pub enum StatusEvent {
    /// Tracking session started
    SessionStarted,

    /// Tracking session stopped
    SessionStopped,

    /// Request acknowledged by the server and removed from the queue
    Delivered { id: PersistedId },

    /// Delivery attempt failed; the request stays at the head of the queue
    DeliveryFailed {
        id: PersistedId,
        failures: u32,
        retry_in: Duration,
        reason: String,
    },

    /// Number of requests still owed changed
    QueueDepth(usize),

    /// Position sensor could not produce fixes
    SensorUnavailable(SensorError),

    /// Durable queue operation failed
    PersistenceFailed(String),

    /// Sample dropped because the server URL is malformed
    FormatRejected(FormatError),
}

/// Broadcast bus for [`StatusEvent`]s
#[derive(Debug, Clone)]
pub struct StatusBus {
    tx: broadcast::Sender<StatusEvent>,
}

impl Default for StatusBus {
    fn default() -> Self {
        Self::new(DEFAULT_STATUS_CAPACITY)
    }
}

impl StatusBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: StatusEvent) {
        let _ = self.tx.send(event);
    }
}
