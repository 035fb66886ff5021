//! # Position Source
//!
//! Drives a location sensor and hands qualifying samples to an observer.
//!
//! Two sampling modes share one task body:
//! - **Periodic**: runs until stopped, filtering fixes by minimum interval
//!   and minimum displacement
//! - **One-shot**: emits the first fix as a `direct` sample and stops itself
//!
//! The observer is called synchronously from the sampling task, so whatever
//! it does with a sample happens before the next fix is read.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::geo::distance_m;
use super::sample::Position;
use super::sensor::{Accuracy, PositionSensor, SensorProvider};
use crate::error::SensorError;

/// Default minimum time between periodic samples
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(300);

/// Sampling configuration for a position source
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SourceConfig {
    /// Minimum time between emitted samples
    pub interval: Duration,

    /// Minimum displacement in metres between emitted samples (0 disables)
    pub distance_m: f64,

    /// Desired accuracy class
    pub accuracy: Accuracy,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_INTERVAL,
            distance_m: 0.0,
            accuracy: Accuracy::High,
        }
    }
}

/// Receives samples and sensor failures from a position source
pub trait PositionObserver: Send + Sync {
    /// Called once per emitted sample, in emission order
    fn on_position(&self, position: Position);

    /// Called when the sensor cannot produce fixes
    fn on_sensor_error(&self, error: SensorError);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Periodic,
    OneShot,
}

/// Handle to a running sampling task
struct SamplingTask {
    config_tx: watch::Sender<SourceConfig>,
    stop_tx: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

impl SamplingTask {
    fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    fn stop(mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// Position source
///
/// Owns at most one periodic sampling task and at most one pending
/// one-shot request, each on its own sensor.
pub struct PositionSource {
    provider: Arc<dyn SensorProvider>,
    observer: Arc<dyn PositionObserver>,
    periodic: Option<SamplingTask>,
    one_shot: Option<SamplingTask>,
    direct_pending: Arc<AtomicBool>,
    config: SourceConfig,
}

impl std::fmt::Debug for PositionSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PositionSource")
            .field("config", &self.config)
            .field("updating", &self.is_updating())
            .field("one_shot_pending", &self.is_one_shot_pending())
            .finish_non_exhaustive()
    }
}

impl PositionSource {
    /// Creates an idle source.
    pub fn new(provider: Arc<dyn SensorProvider>, observer: Arc<dyn PositionObserver>) -> Self {
        Self {
            provider,
            observer,
            periodic: None,
            one_shot: None,
            direct_pending: Arc::new(AtomicBool::new(false)),
            config: SourceConfig::default(),
        }
    }

    /// Begin periodic sampling
    ///
    /// Calling this while already sampling reconfigures the running task in
    /// place instead of opening a second sensor.
    pub fn start_updates(&mut self, config: SourceConfig) {
        if self.set_config(config) {
            return;
        }

        info!(
            "Starting position updates every {:?} (distance filter {} m, accuracy {:?})",
            config.interval, config.distance_m, config.accuracy
        );
        self.periodic = Some(self.spawn(config, Mode::Periodic));
    }

    /// Replace the sampling configuration without starting anything
    ///
    /// A running periodic task picks the new configuration up in place.
    /// Returns `true` if it did.
    pub fn set_config(&mut self, config: SourceConfig) -> bool {
        self.config = config;

        let Some(task) = self.periodic.as_ref().filter(|t| t.is_running()) else {
            return false;
        };
        task.config_tx.send_replace(config);
        debug!(
            "Position source reconfigured: interval {:?}, distance {} m, accuracy {:?}",
            config.interval, config.distance_m, config.accuracy
        );
        true
    }

    /// Stop periodic sampling and any pending one-shot request
    pub fn stop_updates(&mut self) {
        if let Some(task) = self.periodic.take() {
            task.stop();
            info!("Position updates stopped");
        }
        if let Some(task) = self.one_shot.take() {
            task.stop();
            debug!("Pending one-shot position request cancelled");
        }
    }

    /// Emit exactly one `direct` sample on a dedicated sensor, then stop
    ///
    /// Periodic sampling, if running, is not affected. A second request
    /// while one is still pending is absorbed by the pending one.
    pub fn request_one_shot(&mut self) {
        if self.is_one_shot_pending() {
            debug!("One-shot position request already pending");
            return;
        }

        info!("Requesting one-shot position");
        self.one_shot = Some(self.spawn(self.config, Mode::OneShot));
    }

    /// Emit the next periodic fix as a `direct` sample regardless of filters
    pub fn request_direct_update(&self) {
        self.direct_pending.store(true, Ordering::SeqCst);
        debug!("Direct update requested for next periodic fix");
    }

    /// True while the periodic task is running
    pub fn is_updating(&self) -> bool {
        self.periodic.as_ref().is_some_and(SamplingTask::is_running)
    }

    /// True while a one-shot request has not yet emitted or failed
    pub fn is_one_shot_pending(&self) -> bool {
        self.one_shot.as_ref().is_some_and(SamplingTask::is_running)
    }

    /// Current sampling configuration
    pub fn config(&self) -> SourceConfig {
        self.config
    }

    fn spawn(&self, config: SourceConfig, mode: Mode) -> SamplingTask {
        let (config_tx, config_rx) = watch::channel(config);
        let (stop_tx, stop_rx) = oneshot::channel();
        let sensor = self.provider.open_sensor();

        let handle = tokio::spawn(run_sampling(
            sensor,
            config_rx,
            stop_rx,
            Arc::clone(&self.observer),
            Arc::clone(&self.direct_pending),
            mode,
        ));

        SamplingTask {
            config_tx,
            stop_tx: Some(stop_tx),
            handle,
        }
    }
}

impl Drop for PositionSource {
    fn drop(&mut self) {
        self.stop_updates();
    }
}

/// Sampling task body shared by periodic and one-shot modes
async fn run_sampling(
    mut sensor: Box<dyn PositionSensor>,
    mut config_rx: watch::Receiver<SourceConfig>,
    mut stop_rx: oneshot::Receiver<()>,
    observer: Arc<dyn PositionObserver>,
    direct_pending: Arc<AtomicBool>,
    mode: Mode,
) {
    let mut accuracy = config_rx.borrow_and_update().accuracy;

    if let Err(e) = sensor.start(accuracy).await {
        warn!("Position sensor failed to start: {}", e);
        observer.on_sensor_error(e);
        sensor.stop().await;
        return;
    }

    let mut filter = FixFilter::default();

    loop {
        tokio::select! {
            biased;

            _ = &mut stop_rx => break,

            changed = config_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let config = *config_rx.borrow_and_update();
                if config.accuracy != accuracy {
                    accuracy = config.accuracy;
                    if let Err(e) = sensor.start(accuracy).await {
                        warn!("Position sensor rejected accuracy {:?}: {}", accuracy, e);
                        observer.on_sensor_error(e);
                        break;
                    }
                }
            }

            fix = sensor.next_fix() => match fix {
                None => {
                    debug!("Position sensor closed");
                    break;
                }
                Some(Err(e)) => {
                    warn!("Position sensor error: {}", e);
                    observer.on_sensor_error(e);
                }
                Some(Ok(fix)) => {
                    if mode == Mode::OneShot {
                        debug!("One-shot fix at {}, {}", fix.latitude, fix.longitude);
                        observer.on_position(Position::from_fix(&fix, sensor.battery(), true));
                        break;
                    }

                    let direct = direct_pending.swap(false, Ordering::SeqCst);
                    let position = Position::from_fix(&fix, sensor.battery(), direct);
                    let config = *config_rx.borrow();

                    if direct || filter.accept(&position, &config) {
                        filter.record(&position);
                        debug!(
                            "Fix at {}, {} accepted (direct: {})",
                            fix.latitude, fix.longitude, direct
                        );
                        observer.on_position(position);
                    }
                }
            },
        }
    }

    sensor.stop().await;
}

/// Interval and displacement filter for periodic sampling
#[derive(Debug, Default)]
struct FixFilter {
    last: Option<(Instant, f64, f64)>,
}

impl FixFilter {
    /// A fix qualifies when it is the first, or when both the interval has
    /// elapsed and the displacement filter (if any) is met.
    fn accept(&self, position: &Position, config: &SourceConfig) -> bool {
        let Some((at, latitude, longitude)) = self.last else {
            return true;
        };

        if position.captured_at().saturating_duration_since(at) < config.interval {
            return false;
        }

        config.distance_m <= 0.0
            || distance_m((latitude, longitude), (position.latitude(), position.longitude()))
                >= config.distance_m
    }

    fn record(&mut self, position: &Position) {
        self.last = Some((position.captured_at(), position.latitude(), position.longitude()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::position::sample::Fix;
    use crate::position::sensor::{FixFeed, MockPositionSensor, MockSensorProvider};
    use chrono::Utc;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingObserver {
        positions: Mutex<Vec<Position>>,
        errors: Mutex<Vec<SensorError>>,
    }

    impl RecordingObserver {
        fn positions(&self) -> Vec<Position> {
            self.positions.lock().unwrap().clone()
        }

        fn errors(&self) -> Vec<SensorError> {
            self.errors.lock().unwrap().clone()
        }
    }

    impl PositionObserver for RecordingObserver {
        fn on_position(&self, position: Position) {
            self.positions.lock().unwrap().push(position);
        }

        fn on_sensor_error(&self, error: SensorError) {
            self.errors.lock().unwrap().push(error);
        }
    }

    fn config(interval_s: u64, distance_m: f64) -> SourceConfig {
        SourceConfig {
            interval: Duration::from_secs(interval_s),
            distance_m,
            accuracy: Accuracy::High,
        }
    }

    /// Let spawned tasks run until idle
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    fn setup() -> (FixFeed, Arc<RecordingObserver>, PositionSource) {
        let feed = FixFeed::new(16);
        let observer = Arc::new(RecordingObserver::default());
        let source = PositionSource::new(Arc::new(feed.clone()), observer.clone());
        (feed, observer, source)
    }

    #[test]
    fn test_default_config() {
        let config = SourceConfig::default();
        assert_eq!(config.interval, Duration::from_secs(300));
        assert_eq!(config.distance_m, 0.0);
        assert_eq!(config.accuracy, Accuracy::High);
    }

    #[tokio::test(start_paused = true)]
    async fn test_filter_accepts_first_fix() {
        let filter = FixFilter::default();
        let position = Position::new(Utc::now(), 1.0, 1.0);
        assert!(filter.accept(&position, &config(30, 100.0)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_filter_enforces_interval() {
        let mut filter = FixFilter::default();
        filter.record(&Position::new(Utc::now(), 1.0, 1.0));

        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(!filter.accept(&Position::new(Utc::now(), 1.0, 1.0), &config(30, 0.0)));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(filter.accept(&Position::new(Utc::now(), 1.0, 1.0), &config(30, 0.0)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_filter_enforces_distance() {
        let mut filter = FixFilter::default();
        filter.record(&Position::new(Utc::now(), 51.5, -0.12));
        tokio::time::advance(Duration::from_secs(60)).await;

        // ~11 m away
        let near = Position::new(Utc::now(), 51.5001, -0.12);
        assert!(!filter.accept(&near, &config(30, 50.0)));

        // ~111 m away
        let far = Position::new(Utc::now(), 51.501, -0.12);
        assert!(filter.accept(&far, &config(30, 50.0)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_updates_respect_interval() {
        let (feed, observer, mut source) = setup();
        source.start_updates(config(30, 0.0));
        settle().await;

        feed.publish(Fix::at(Utc::now(), 10.0, 20.0));
        settle().await;
        feed.publish(Fix::at(Utc::now(), 10.1, 20.1));
        settle().await;
        assert_eq!(observer.positions().len(), 1);

        tokio::time::advance(Duration::from_secs(30)).await;
        feed.publish(Fix::at(Utc::now(), 10.2, 20.2));
        settle().await;

        let positions = observer.positions();
        assert_eq!(positions.len(), 2);
        assert_eq!(positions[1].latitude(), 10.2);
        assert!(positions.iter().all(|p| !p.is_direct()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_updates_twice_reconfigures_in_place() {
        let (feed, observer, mut source) = setup();
        source.start_updates(config(300, 0.0));
        settle().await;
        source.start_updates(config(1, 0.0));
        settle().await;

        assert_eq!(feed.open_sensors(), 1);
        assert_eq!(source.config().interval, Duration::from_secs(1));

        feed.publish(Fix::at(Utc::now(), 1.0, 1.0));
        settle().await;
        tokio::time::advance(Duration::from_secs(1)).await;
        feed.publish(Fix::at(Utc::now(), 2.0, 2.0));
        settle().await;

        // Exactly one sample per fix: no duplicate task
        assert_eq!(observer.positions().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_updates_releases_sensor() {
        let (feed, observer, mut source) = setup();
        source.start_updates(config(30, 0.0));
        settle().await;
        assert!(source.is_updating());

        source.stop_updates();
        settle().await;

        assert!(!source.is_updating());
        assert_eq!(feed.open_sensors(), 0);
        feed.publish(Fix::at(Utc::now(), 1.0, 1.0));
        settle().await;
        assert!(observer.positions().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_shot_emits_single_direct_sample_and_stops() {
        let (feed, observer, mut source) = setup();
        source.request_one_shot();
        settle().await;
        assert!(source.is_one_shot_pending());

        feed.publish(Fix::at(Utc::now(), 5.0, 6.0));
        settle().await;
        feed.publish(Fix::at(Utc::now(), 7.0, 8.0));
        settle().await;

        let positions = observer.positions();
        assert_eq!(positions.len(), 1);
        assert!(positions[0].is_direct());
        assert_eq!(positions[0].latitude(), 5.0);
        assert!(!source.is_one_shot_pending());
        assert_eq!(feed.open_sensors(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_shot_leaves_periodic_sampling_running() {
        let (feed, observer, mut source) = setup();
        source.start_updates(config(30, 0.0));
        source.request_one_shot();
        settle().await;
        assert_eq!(feed.open_sensors(), 2);

        feed.publish(Fix::at(Utc::now(), 1.0, 1.0));
        settle().await;

        let positions = observer.positions();
        assert_eq!(positions.len(), 2);
        assert_eq!(positions.iter().filter(|p| p.is_direct()).count(), 1);
        assert!(source.is_updating());
        assert_eq!(feed.open_sensors(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_direct_update_bypasses_filter() {
        let (feed, observer, mut source) = setup();
        source.start_updates(config(300, 0.0));
        settle().await;

        feed.publish(Fix::at(Utc::now(), 1.0, 1.0));
        settle().await;
        source.request_direct_update();
        feed.publish(Fix::at(Utc::now(), 1.0, 1.0));
        settle().await;
        feed.publish(Fix::at(Utc::now(), 1.0, 1.0));
        settle().await;

        let positions = observer.positions();
        assert_eq!(positions.len(), 2);
        assert!(!positions[0].is_direct());
        assert!(positions[1].is_direct());
    }

    #[tokio::test(start_paused = true)]
    async fn test_permission_denied_reported_without_emitting() {
        let mut provider = MockSensorProvider::new();
        provider.expect_open_sensor().times(1).returning(|| {
            let mut sensor = MockPositionSensor::new();
            sensor
                .expect_start()
                .returning(|_| Err(SensorError::PermissionDenied));
            sensor.expect_stop().times(1).returning(|| ());
            sensor.expect_next_fix().never();
            Box::new(sensor)
        });

        let observer = Arc::new(RecordingObserver::default());
        let mut source = PositionSource::new(Arc::new(provider), observer.clone());
        source.start_updates(config(30, 0.0));
        settle().await;

        assert_eq!(observer.errors(), vec![SensorError::PermissionDenied]);
        assert!(observer.positions().is_empty());
        assert!(!source.is_updating());
    }
}
