//! # Position Samples
//!
//! Raw sensor fixes and the immutable position samples built from them.

use chrono::{DateTime, Utc};
use tokio::time::Instant;

/// Metres per second to knots
pub const MPS_TO_KNOTS: f64 = 1.943_844_5;

/// Raw fix as reported by a location sensor
///
/// Units follow the sensor: metres, metres per second, degrees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Fix {
    /// Wall-clock time the fix was taken
    pub time: DateTime<Utc>,

    /// Latitude in degrees
    pub latitude: f64,

    /// Longitude in degrees
    pub longitude: f64,

    /// Altitude in metres
    pub altitude: f64,

    /// Ground speed in m/s
    pub speed: f64,

    /// Course over ground in degrees
    pub course: f64,

    /// Horizontal accuracy radius in metres
    pub accuracy: f64,
}

impl Fix {
    /// Fix at the given coordinates with every other field zeroed.
    #[must_use]
    pub fn at(time: DateTime<Utc>, latitude: f64, longitude: f64) -> Self {
        Self {
            time,
            latitude,
            longitude,
            altitude: 0.0,
            speed: 0.0,
            course: 0.0,
            accuracy: 0.0,
        }
    }
}

/// Battery state captured alongside a fix
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct BatteryStatus {
    /// Charge level in percent (0-100)
    pub level: f64,

    /// External power connected
    pub charging: bool,
}

/// One timestamped position sample
///
/// Built once by the position source and never mutated afterwards; the
/// `with_*` methods consume the value and are only used while building it.
#[derive(Debug, Clone, PartialEq)]
pub struct Position {
    captured_at: Instant,
    time: DateTime<Utc>,
    latitude: f64,
    longitude: f64,
    altitude: f64,
    speed: f64,
    bearing: f64,
    accuracy: f64,
    battery: BatteryStatus,
    direct: bool,
}

impl Position {
    /// Creates a sample at the given coordinates, captured now.
    #[must_use]
    pub fn new(time: DateTime<Utc>, latitude: f64, longitude: f64) -> Self {
        Self {
            captured_at: Instant::now(),
            time,
            latitude,
            longitude,
            altitude: 0.0,
            speed: 0.0,
            bearing: 0.0,
            accuracy: 0.0,
            battery: BatteryStatus::default(),
            direct: false,
        }
    }

    /// Builds a sample from a sensor fix, converting speed to knots.
    #[must_use]
    pub fn from_fix(fix: &Fix, battery: BatteryStatus, direct: bool) -> Self {
        Self::new(fix.time, fix.latitude, fix.longitude)
            .with_altitude(fix.altitude)
            .with_speed(fix.speed * MPS_TO_KNOTS)
            .with_bearing(fix.course)
            .with_accuracy(fix.accuracy)
            .with_battery(battery)
            .with_direct(direct)
    }

    #[must_use]
    pub fn with_altitude(mut self, altitude: f64) -> Self {
        self.altitude = altitude;
        self
    }

    /// Speed in knots.
    #[must_use]
    pub fn with_speed(mut self, knots: f64) -> Self {
        self.speed = knots;
        self
    }

    #[must_use]
    pub fn with_bearing(mut self, bearing: f64) -> Self {
        self.bearing = bearing;
        self
    }

    #[must_use]
    pub fn with_accuracy(mut self, accuracy: f64) -> Self {
        self.accuracy = accuracy;
        self
    }

    #[must_use]
    pub fn with_battery(mut self, battery: BatteryStatus) -> Self {
        self.battery = battery;
        self
    }

    #[must_use]
    pub fn with_direct(mut self, direct: bool) -> Self {
        self.direct = direct;
        self
    }

    /// Monotonic capture instant, used for interval filtering.
    pub fn captured_at(&self) -> Instant {
        self.captured_at
    }

    /// Wall-clock fix time.
    pub fn time(&self) -> DateTime<Utc> {
        self.time
    }

    pub fn latitude(&self) -> f64 {
        self.latitude
    }

    pub fn longitude(&self) -> f64 {
        self.longitude
    }

    /// Altitude in metres.
    pub fn altitude(&self) -> f64 {
        self.altitude
    }

    /// Speed in knots.
    pub fn speed(&self) -> f64 {
        self.speed
    }

    /// Bearing in degrees.
    pub fn bearing(&self) -> f64 {
        self.bearing
    }

    /// Horizontal accuracy in metres.
    pub fn accuracy(&self) -> f64 {
        self.accuracy
    }

    pub fn battery(&self) -> BatteryStatus {
        self.battery
    }

    /// True when the sample came from a one-shot or forced update.
    pub fn is_direct(&self) -> bool {
        self.direct
    }
}
