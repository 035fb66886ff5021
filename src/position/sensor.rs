//! Trait abstraction for location sensors to enable testing
//!
//! The platform's location service sits behind [`PositionSensor`]. A
//! [`SensorProvider`] opens a fresh sensor every time a position source
//! starts, so periodic and one-shot sampling never share a sensor handle.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::warn;

use super::sample::{BatteryStatus, Fix};
use crate::error::SensorError;

/// Desired accuracy class for a sensor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Accuracy {
    /// Satellite positioning
    #[default]
    High,
    /// Network-assisted positioning
    Medium,
    /// Cell/coarse positioning
    Low,
}

/// Trait for location sensor operations
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PositionSensor: Send {
    /// Begin (or re-tune) delivery of fixes at the requested accuracy
    async fn start(&mut self, accuracy: Accuracy) -> Result<(), SensorError>;

    /// Wait for the next fix
    ///
    /// Must be cancel-safe: the source polls it inside `select!`.
    /// Returns `None` once the sensor will produce no further fixes.
    async fn next_fix(&mut self) -> Option<Result<Fix, SensorError>>;

    /// Stop delivery and release the sensor
    async fn stop(&mut self);

    /// Battery state to attach to the next sample
    fn battery(&self) -> BatteryStatus;
}

/// Opens sensors for position sources
#[cfg_attr(test, mockall::automock)]
pub trait SensorProvider: Send + Sync {
    fn open_sensor(&self) -> Box<dyn PositionSensor>;
}

/// Fix feed bridging a platform location callback into sensors
///
/// The platform glue calls [`FixFeed::publish`] from its location callback;
/// every sensor opened from the feed receives fixes published while it is
/// open.
#[derive(Clone)]
pub struct FixFeed {
    tx: broadcast::Sender<Fix>,
    battery: Arc<Mutex<BatteryStatus>>,
}

impl std::fmt::Debug for FixFeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FixFeed")
            .field("subscribers", &self.tx.receiver_count())
            .finish_non_exhaustive()
    }
}

impl FixFeed {
    /// Creates a feed buffering up to `capacity` fixes per open sensor.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            battery: Arc::new(Mutex::new(BatteryStatus::default())),
        }
    }

    /// Publish a fix to every open sensor
    ///
    /// Returns the number of sensors that received it.
    pub fn publish(&self, fix: Fix) -> usize {
        self.tx.send(fix).unwrap_or(0)
    }

    /// Record the latest battery reading.
    pub fn set_battery(&self, battery: BatteryStatus) {
        if let Ok(mut current) = self.battery.lock() {
            *current = battery;
        }
    }

    /// Number of sensors currently open on this feed.
    pub fn open_sensors(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl SensorProvider for FixFeed {
    fn open_sensor(&self) -> Box<dyn PositionSensor> {
        Box::new(FeedSensor {
            rx: Some(self.tx.subscribe()),
            battery: Arc::clone(&self.battery),
        })
    }
}

/// Sensor subscribed to a [`FixFeed`]
struct FeedSensor {
    rx: Option<broadcast::Receiver<Fix>>,
    battery: Arc<Mutex<BatteryStatus>>,
}

#[async_trait]
impl PositionSensor for FeedSensor {
    async fn start(&mut self, _accuracy: Accuracy) -> Result<(), SensorError> {
        if self.rx.is_none() {
            return Err(SensorError::Unavailable("fix feed already stopped".to_string()));
        }
        Ok(())
    }

    async fn next_fix(&mut self) -> Option<Result<Fix, SensorError>> {
        let rx = self.rx.as_mut()?;
        loop {
            match rx.recv().await {
                Ok(fix) => return Some(Ok(fix)),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Sensor lagged behind fix feed, skipped {} fixes", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    async fn stop(&mut self) {
        self.rx = None;
    }

    fn battery(&self) -> BatteryStatus {
        self.battery.lock().map(|b| *b).unwrap_or_default()
    }
}
