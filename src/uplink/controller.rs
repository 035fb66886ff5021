//! # Uplink Controller
//!
//! Drains the durable queue against a delivery transport.
//!
//! ## States
//!
//! - `Idle`: nothing in flight; waits for a wake-up when the queue is empty
//! - `Sending`: exactly one request in flight
//! - `Backoff`: last attempt failed; waits for the retry deadline
//! - `Stopped`: terminal
//!
//! The head of the queue is only removed after the transport reports
//! success for that id, and a failed head is retried before anything newer,
//! so delivery is strictly FIFO with at most one request in flight.
//!
//! ## Stopping
//!
//! A send already in flight when the controller stops keeps running on its
//! own task, but its outcome is discarded without touching the queue. The
//! request stays queued and is sent again by the next controller.
//!
//! Controllers that share a [`DeliverySlot`] never overlap sends: the
//! abandoned send holds the slot until it completes, and the next
//! controller waits for it before its first attempt.

use std::sync::Arc;

use tokio::sync::{watch, Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

use super::backoff::BackoffPolicy;
use crate::queue::{DurableQueue, PersistedId, QueuedRequest};
use crate::status::{StatusBus, StatusEvent};
use crate::transport::{DeliveryOutcome, DeliveryTransport};

/// Observable controller state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UplinkState {
    Idle,
    Sending { id: PersistedId },
    Backoff { failures: u32, until: Instant },
    Stopped,
}

/// Uplink controller
///
/// Consumed by [`UplinkController::start`], which spawns the delivery task
/// and returns its handle.
pub struct UplinkController {
    queue: Arc<dyn DurableQueue>,
    transport: Arc<dyn DeliveryTransport>,
    policy: BackoffPolicy,
    status: StatusBus,
    waker: UplinkWaker,
    slot: DeliverySlot,
}

impl UplinkController {
    pub fn new(
        queue: Arc<dyn DurableQueue>,
        transport: Arc<dyn DeliveryTransport>,
        policy: BackoffPolicy,
        status: StatusBus,
    ) -> Self {
        Self {
            queue,
            transport,
            policy,
            status,
            waker: UplinkWaker::new(),
            slot: DeliverySlot::new(),
        }
    }

    /// Listen on an existing waker instead of a fresh one
    ///
    /// Producers created before the controller keep waking it.
    #[must_use]
    pub fn with_waker(mut self, waker: UplinkWaker) -> Self {
        self.waker = waker;
        self
    }

    /// Share the in-flight slot with earlier controllers on the same queue
    #[must_use]
    pub fn with_slot(mut self, slot: DeliverySlot) -> Self {
        self.slot = slot;
        self
    }

    /// Spawn the delivery task
    ///
    /// Whatever is already queued (including entries left by a previous
    /// process) is sent immediately.
    pub fn start(self) -> UplinkHandle {
        let wake = self.waker.notify;
        let (stop_tx, stop_rx) = watch::channel(false);
        let (state_tx, state_rx) = watch::channel(UplinkState::Idle);

        let worker = Worker {
            queue: self.queue,
            transport: self.transport,
            policy: self.policy,
            status: self.status,
            wake: Arc::clone(&wake),
            slot: self.slot,
            stop_rx,
            state_tx,
            failures: 0,
        };
        let task = tokio::spawn(worker.run());

        UplinkHandle {
            wake,
            stop_tx,
            state_rx,
            task: Some(task),
        }
    }
}

/// Handle to a running uplink controller
///
/// Dropping the handle stops the controller.
pub struct UplinkHandle {
    wake: Arc<Notify>,
    stop_tx: watch::Sender<bool>,
    state_rx: watch::Receiver<UplinkState>,
    task: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for UplinkHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UplinkHandle")
            .field("state", &*self.state_rx.borrow())
            .finish_non_exhaustive()
    }
}

impl UplinkHandle {
    /// Tell an idle controller that the queue grew
    ///
    /// Never interrupts a send or a backoff wait.
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    /// Cloneable wake-up handle for queue producers
    pub fn waker(&self) -> UplinkWaker {
        UplinkWaker {
            notify: Arc::clone(&self.wake),
        }
    }

    /// Current state snapshot
    pub fn state(&self) -> UplinkState {
        self.state_rx.borrow().clone()
    }

    /// Watch state transitions
    pub fn subscribe_state(&self) -> watch::Receiver<UplinkState> {
        self.state_rx.clone()
    }

    /// Stop the controller; safe to call from any state, more than once
    pub fn stop(&self) {
        self.stop_tx.send_replace(true);
    }

    /// Stop and wait for the delivery task to exit
    pub async fn shutdown(mut self) {
        self.stop();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                error!("Uplink task ended abnormally: {}", e);
            }
        }
    }
}

/// Wakes an idle controller
///
/// A wake-up with no controller listening is kept for the next one.
#[derive(Debug, Clone, Default)]
pub struct UplinkWaker {
    notify: Arc<Notify>,
}

impl UplinkWaker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn wake(&self) {
        self.notify.notify_one();
    }
}

/// At most one outstanding send, across controller restarts
#[derive(Debug, Clone)]
pub struct DeliverySlot {
    permits: Arc<Semaphore>,
}

impl Default for DeliverySlot {
    fn default() -> Self {
        Self {
            permits: Arc::new(Semaphore::new(1)),
        }
    }
}

impl DeliverySlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// True while no send holds the slot
    pub fn is_free(&self) -> bool {
        self.permits.available_permits() > 0
    }
}

impl Drop for UplinkHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

enum Flow {
    Continue,
    Stopped,
}

struct Worker {
    queue: Arc<dyn DurableQueue>,
    transport: Arc<dyn DeliveryTransport>,
    policy: BackoffPolicy,
    status: StatusBus,
    wake: Arc<Notify>,
    slot: DeliverySlot,
    stop_rx: watch::Receiver<bool>,
    state_tx: watch::Sender<UplinkState>,
    failures: u32,
}

impl Worker {
    async fn run(mut self) {
        info!("Uplink controller started");

        loop {
            if self.is_stopped() {
                break;
            }

            let flow = match self.queue.peek_oldest() {
                Ok(Some(head)) => self.deliver(head).await,
                Ok(None) => self.idle().await,
                Err(e) => {
                    error!("Failed to read queue head: {}", e);
                    self.status.emit(StatusEvent::PersistenceFailed(e.to_string()));
                    self.back_off().await
                }
            };

            if let Flow::Stopped = flow {
                break;
            }
        }

        self.state_tx.send_replace(UplinkState::Stopped);
        info!("Uplink controller stopped");
    }

    /// Wait for a wake-up with an empty queue
    async fn idle(&mut self) -> Flow {
        self.state_tx.send_replace(UplinkState::Idle);
        debug!("Queue empty, waiting for new requests");

        tokio::select! {
            biased;
            _ = wait_stopped(&mut self.stop_rx) => Flow::Stopped,
            _ = self.wake.notified() => Flow::Continue,
        }
    }

    /// Send the queue head once and apply the outcome
    async fn deliver(&mut self, head: QueuedRequest) -> Flow {
        let QueuedRequest { id, request } = head;
        let Some(permit) = self.acquire_slot(id).await else {
            return Flow::Stopped;
        };

        self.state_tx.send_replace(UplinkState::Sending { id });
        debug!("Sending request {}: {}", id, request.url());

        let transport = Arc::clone(&self.transport);
        let mut send = tokio::spawn(async move {
            let _permit = permit;
            transport.send(&request).await
        });

        let outcome = tokio::select! {
            biased;
            _ = wait_stopped(&mut self.stop_rx) => {
                debug!("Stopped with request {} in flight, its outcome will be ignored", id);
                return Flow::Stopped;
            }
            joined = &mut send => joined.unwrap_or_else(|e| {
                DeliveryOutcome::TransientFailure(format!("send task failed: {}", e))
            }),
        };

        // A stop that raced the outcome wins: never mutate the queue after it.
        if self.is_stopped() {
            debug!("Discarding outcome of request {} after stop", id);
            return Flow::Stopped;
        }

        match outcome {
            DeliveryOutcome::Success => self.on_success(id).await,
            failure => {
                let reason = failure.reason().unwrap_or_default().to_string();
                self.failures = self.failures.saturating_add(1);
                let retry_in = self.policy.delay(self.failures);
                warn!(
                    "Delivery of request {} failed ({}), attempt {}, retrying in {:?}",
                    id, reason, self.failures, retry_in
                );
                self.status.emit(StatusEvent::DeliveryFailed {
                    id,
                    failures: self.failures,
                    retry_in,
                    reason,
                });
                self.wait_until(Instant::now() + retry_in).await
            }
        }
    }

    /// Wait until no other send is outstanding; `None` once stopped
    async fn acquire_slot(&mut self, id: PersistedId) -> Option<OwnedSemaphorePermit> {
        if let Ok(permit) = Arc::clone(&self.slot.permits).try_acquire_owned() {
            return Some(permit);
        }

        debug!("Previous send still in flight, request {} waits for it", id);
        let acquire = Arc::clone(&self.slot.permits).acquire_owned();
        tokio::select! {
            biased;
            _ = wait_stopped(&mut self.stop_rx) => None,
            acquired = acquire => match acquired {
                Ok(permit) => Some(permit),
                Err(e) => {
                    error!("Delivery slot closed: {}", e);
                    None
                }
            },
        }
    }

    async fn on_success(&mut self, id: PersistedId) -> Flow {
        if let Err(e) = self.queue.remove(id) {
            // The request stays queued and will be sent again.
            error!("Failed to remove delivered request {}: {}", id, e);
            self.status.emit(StatusEvent::PersistenceFailed(e.to_string()));
            return self.back_off().await;
        }

        self.failures = 0;
        info!("Delivered request {}", id);
        self.status.emit(StatusEvent::Delivered { id });
        match self.queue.count() {
            Ok(depth) => self.status.emit(StatusEvent::QueueDepth(depth)),
            Err(e) => warn!("Failed to count queue: {}", e),
        }

        self.state_tx.send_replace(UplinkState::Idle);
        Flow::Continue
    }

    /// Back off after a queue failure
    async fn back_off(&mut self) -> Flow {
        self.failures = self.failures.saturating_add(1);
        let until = Instant::now() + self.policy.delay(self.failures);
        self.wait_until(until).await
    }

    async fn wait_until(&mut self, until: Instant) -> Flow {
        self.state_tx.send_replace(UplinkState::Backoff {
            failures: self.failures,
            until,
        });

        tokio::select! {
            biased;
            _ = wait_stopped(&mut self.stop_rx) => Flow::Stopped,
            _ = sleep_until(until) => Flow::Continue,
        }
    }

    fn is_stopped(&self) -> bool {
        *self.stop_rx.borrow()
    }
}

/// Resolves once stop is requested or the handle is gone
async fn wait_stopped(stop_rx: &mut watch::Receiver<bool>) {
    let _ = stop_rx.wait_for(|stopped| *stopped).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::mocks::FailingQueue;
    use crate::protocol::RequestDescriptor;
    use crate::queue::{MemoryQueue, SqliteQueue};
    use crate::transport::mocks::MockTransport;
    use std::time::Duration;
    use tempfile::TempDir;

    fn request(n: u32) -> RequestDescriptor {
        RequestDescriptor::new(format!("http://host/?id=dev&n={}", n))
    }

    fn policy() -> BackoffPolicy {
        BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(60))
    }

    fn start(queue: Arc<dyn DurableQueue>, transport: &MockTransport) -> UplinkHandle {
        UplinkController::new(queue, Arc::new(transport.clone()), policy(), StatusBus::default())
            .start()
    }

    /// Let spawned tasks run until idle
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    async fn wait_until<F: Fn() -> bool>(condition: F) {
        for _ in 0..10_000 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test(start_paused = true)]
    async fn test_drains_queue_in_order() {
        let queue = Arc::new(MemoryQueue::new());
        for n in 1..=5 {
            queue.append(&request(n)).unwrap();
        }
        let transport = MockTransport::new();

        let handle = start(queue.clone(), &transport);
        wait_until(|| queue.count().unwrap() == 0).await;

        let expected: Vec<String> = (1..=5).map(|n| request(n).url().to_string()).collect();
        assert_eq!(transport.sent_urls(), expected);
        assert_eq!(transport.max_in_flight(), 1);

        settle().await;
        assert_eq!(handle.state(), UplinkState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_flight_while_appending() {
        let queue = Arc::new(MemoryQueue::new());
        let transport = MockTransport::new();
        transport.set_latency(Duration::from_secs(3));

        let handle = start(queue.clone(), &transport);
        settle().await;
        assert_eq!(handle.state(), UplinkState::Idle);

        for n in 1..=4 {
            queue.append(&request(n)).unwrap();
            handle.wake();
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        wait_until(|| queue.count().unwrap() == 0).await;

        assert_eq!(transport.max_in_flight(), 1);
        assert_eq!(transport.sent_urls().len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wake_is_not_lost_when_idle() {
        let queue = Arc::new(MemoryQueue::new());
        let transport = MockTransport::new();
        let handle = start(queue.clone(), &transport);
        settle().await;

        queue.append(&request(1)).unwrap();
        handle.waker().wake();
        settle().await;

        assert_eq!(queue.count().unwrap(), 0);
        assert_eq!(transport.sent_urls(), vec![request(1).url().to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_back_off_on_same_head() {
        let queue = Arc::new(MemoryQueue::new());
        let head = queue.append(&request(1)).unwrap();
        queue.append(&request(2)).unwrap();
        queue.append(&request(3)).unwrap();

        let transport = MockTransport::failing();
        let status = StatusBus::default();
        let mut events = status.subscribe();
        let _handle = UplinkController::new(
            queue.clone(),
            Arc::new(transport.clone()),
            policy(),
            status,
        )
        .start();

        wait_until(|| transport.sent_urls().len() >= 5).await;

        assert_eq!(queue.count().unwrap(), 3);
        assert_eq!(queue.peek_oldest().unwrap().unwrap().id, head);
        assert!(transport.sent_urls().iter().all(|url| url == request(1).url()));

        // 2s, 4s, 8s, 16s between attempts
        let times = transport.attempt_times();
        for (k, pair) in times.windows(2).enumerate() {
            let expected = policy().delay(k as u32 + 1);
            let actual = pair[1] - pair[0];
            assert!(actual >= expected, "attempt {}: waited {:?} < {:?}", k + 2, actual, expected);
            assert!(actual < expected + Duration::from_secs(1));
        }

        let mut retry_delays = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let StatusEvent::DeliveryFailed { id, retry_in, .. } = event {
                assert_eq!(id, head);
                retry_delays.push(retry_in);
            }
        }
        assert!(retry_delays.len() >= 4);
        assert!(retry_delays.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_deadline_increases() {
        let queue = Arc::new(MemoryQueue::new());
        queue.append(&request(1)).unwrap();
        let transport = MockTransport::failing();
        let handle = start(queue.clone(), &transport);
        let mut state = handle.subscribe_state();

        let mut deadlines = Vec::new();
        while deadlines.len() < 3 {
            state.changed().await.unwrap();
            if let UplinkState::Backoff { failures, until } = *state.borrow_and_update() {
                assert_eq!(failures as usize, deadlines.len() + 1);
                deadlines.push(until);
            }
        }

        assert!(deadlines[0] < deadlines[1]);
        assert!(deadlines[1] < deadlines[2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_resets_after_success() {
        let queue = Arc::new(MemoryQueue::new());
        queue.append(&request(1)).unwrap();
        queue.append(&request(2)).unwrap();

        let transport = MockTransport::new();
        transport.push_outcome(DeliveryOutcome::TransientFailure("timeout".into()));
        transport.push_outcome(DeliveryOutcome::PermanentFailure("HTTP 400".into()));
        transport.push_outcome(DeliveryOutcome::Success);
        transport.push_outcome(DeliveryOutcome::TransientFailure("timeout".into()));
        transport.set_fallback(DeliveryOutcome::Success);

        let _handle = start(queue.clone(), &transport);
        wait_until(|| queue.count().unwrap() == 0).await;

        let times = transport.attempt_times();
        assert_eq!(times.len(), 5);
        let gaps: Vec<u64> = times.windows(2).map(|w| (w[1] - w[0]).as_secs()).collect();
        // fail (2s), fail (4s), success (eager), fail with reset counter (2s)
        assert_eq!(gaps, vec![2, 4, 0, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_with_send_in_flight_keeps_request() {
        let queue = Arc::new(MemoryQueue::new());
        queue.append(&request(1)).unwrap();
        let transport = MockTransport::new();
        transport.set_latency(Duration::from_secs(10));

        let handle = start(queue.clone(), &transport);
        settle().await;
        assert!(matches!(handle.state(), UplinkState::Sending { .. }));

        handle.stop();
        settle().await;
        assert_eq!(handle.state(), UplinkState::Stopped);

        // The in-flight send completes successfully, but nobody applies it
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(transport.attempt_times().len(), 1);
        assert_eq!(queue.count().unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_backoff_timer() {
        let queue = Arc::new(MemoryQueue::new());
        queue.append(&request(1)).unwrap();
        let transport = MockTransport::failing();

        let handle = start(queue.clone(), &transport);
        settle().await;
        assert!(matches!(handle.state(), UplinkState::Backoff { failures: 1, .. }));

        handle.shutdown().await;
        tokio::time::sleep(Duration::from_secs(600)).await;

        assert_eq!(transport.attempt_times().len(), 1);
        assert_eq!(queue.count().unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_drains_persisted_requests_in_order() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("queue.db");

        // First run: requests queued, server never reached
        {
            let queue = Arc::new(SqliteQueue::open(&path).unwrap());
            for n in 1..=3 {
                queue.append(&request(n)).unwrap();
            }
            let transport = MockTransport::failing();
            let handle = start(queue.clone(), &transport);
            settle().await;
            handle.shutdown().await;
            assert_eq!(queue.count().unwrap(), 3);
        }

        // Second run: fresh controller, no new positions
        let queue = Arc::new(SqliteQueue::open(&path).unwrap());
        let transport = MockTransport::new();
        let _handle = start(queue.clone(), &transport);
        wait_until(|| queue.count().unwrap() == 0).await;

        let expected: Vec<String> = (1..=3).map(|n| request(n).url().to_string()).collect();
        assert_eq!(transport.sent_urls(), expected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_next_controller_waits_for_abandoned_send() {
        let queue = Arc::new(MemoryQueue::new());
        queue.append(&request(1)).unwrap();
        let transport = MockTransport::new();
        transport.set_latency(Duration::from_secs(10));
        let slot = DeliverySlot::new();

        let first = UplinkController::new(
            queue.clone(),
            Arc::new(transport.clone()),
            policy(),
            StatusBus::default(),
        )
        .with_slot(slot.clone())
        .start();
        settle().await;
        first.shutdown().await;
        assert!(!slot.is_free());

        let second = UplinkController::new(
            queue.clone(),
            Arc::new(transport.clone()),
            policy(),
            StatusBus::default(),
        )
        .with_slot(slot.clone())
        .start();
        settle().await;
        assert_eq!(second.state(), UplinkState::Idle);
        assert_eq!(transport.attempt_times().len(), 1);

        tokio::time::sleep(Duration::from_secs(30)).await;

        let times = transport.attempt_times();
        assert_eq!(times.len(), 2);
        assert!(times[1] - times[0] >= Duration::from_secs(10));
        assert_eq!(transport.max_in_flight(), 1);
        assert_eq!(queue.count().unwrap(), 0);
        assert!(slot.is_free());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_while_waiting_for_slot() {
        let queue = Arc::new(MemoryQueue::new());
        queue.append(&request(1)).unwrap();
        let transport = MockTransport::new();
        let slot = DeliverySlot::new();
        let held = Arc::clone(&slot.permits).try_acquire_owned().unwrap();

        let handle = UplinkController::new(
            queue.clone(),
            Arc::new(transport.clone()),
            policy(),
            StatusBus::default(),
        )
        .with_slot(slot.clone())
        .start();
        settle().await;

        handle.shutdown().await;
        drop(held);
        settle().await;

        assert!(transport.attempt_times().is_empty());
        assert_eq!(queue.count().unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waker_created_before_controller() {
        let queue = Arc::new(MemoryQueue::new());
        let transport = MockTransport::new();
        let waker = UplinkWaker::new();

        let _handle = UplinkController::new(
            queue.clone(),
            Arc::new(transport.clone()),
            policy(),
            StatusBus::default(),
        )
        .with_waker(waker.clone())
        .start();
        settle().await;

        queue.append(&request(1)).unwrap();
        waker.wake();
        settle().await;

        assert_eq!(queue.count().unwrap(), 0);
        assert_eq!(transport.sent_urls(), vec![request(1).url().to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_failure_is_reported_and_retried() {
        let transport = MockTransport::new();
        let status = StatusBus::default();
        let mut events = status.subscribe();
        let handle = UplinkController::new(
            Arc::new(FailingQueue::broken()),
            Arc::new(transport.clone()),
            policy(),
            status,
        )
        .start();

        tokio::time::sleep(Duration::from_secs(10)).await;

        assert!(matches!(events.try_recv(), Ok(StatusEvent::PersistenceFailed(_))));
        assert!(matches!(events.try_recv(), Ok(StatusEvent::PersistenceFailed(_))));
        assert!(matches!(handle.state(), UplinkState::Backoff { .. }));
        assert!(transport.attempt_times().is_empty());
    }
}
