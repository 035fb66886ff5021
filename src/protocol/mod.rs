//! # Protocol Module
//!
//! Request contract for the tracking server.
//!
//! Every sample is sent as one HTTP request to the configured base URL with
//! the sample encoded in the query string (OsmAnd-style parameters).

pub mod formatter;

pub use formatter::format_position;

/// Device identifier parameter
pub const PARAM_DEVICE_ID: &str = "id";

/// Latitude parameter (degrees)
pub const PARAM_LATITUDE: &str = "lat";

/// Longitude parameter (degrees)
pub const PARAM_LONGITUDE: &str = "lon";

/// Speed parameter (knots)
pub const PARAM_SPEED: &str = "speed";

/// Fix time parameter (Unix seconds)
pub const PARAM_TIMESTAMP: &str = "timestamp";

/// Altitude parameter (metres)
pub const PARAM_ALTITUDE: &str = "altitude";

/// Bearing parameter (degrees)
pub const PARAM_BEARING: &str = "bearing";

/// Horizontal accuracy parameter (metres)
pub const PARAM_ACCURACY: &str = "accuracy";

/// Battery level parameter (percent)
pub const PARAM_BATTERY: &str = "batt";

/// Charging flag parameter
pub const PARAM_CHARGE: &str = "charge";

/// Alarm reason parameter
pub const PARAM_ALARM: &str = "alarm";

/// Fully formed, ready-to-send request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestDescriptor {
    url: String,
}

impl RequestDescriptor {
    /// Wrap an already formatted request URL.
    pub fn new(url: String) -> Self {
        Self { url }
    }

    /// Full request URL including query parameters.
    pub fn url(&self) -> &str {
        &self.url
    }
}
