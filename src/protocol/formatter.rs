//! # Request Formatter
//!
//! Encodes position samples into outbound request descriptors.

use url::Url;

use super::{
    RequestDescriptor,
    PARAM_ACCURACY,
    PARAM_ALARM,
    PARAM_ALTITUDE,
    PARAM_BATTERY,
    PARAM_BEARING,
    PARAM_CHARGE,
    PARAM_DEVICE_ID,
    PARAM_LATITUDE,
    PARAM_LONGITUDE,
    PARAM_SPEED,
    PARAM_TIMESTAMP,
};
use crate::error::FormatError;
use crate::position::Position;

/// Encode a position sample into a request descriptor
///
/// # Arguments
///
/// * `position` - Sample to encode
/// * `device_id` - Device identifier sent as `id`
/// * `base_url` - Server base URL (absolute, with scheme and host)
/// * `alarm` - Optional alarm reason sent as `alarm`
///
/// # Returns
///
/// * `Result<RequestDescriptor, FormatError>` - Descriptor with every sample
///   field appended as a query parameter
///
/// # Errors
///
/// Returns error if `base_url` is not an absolute URL with a host
///
/// # Examples
///
/// ```
/// use chrono::Utc;
/// use geo_uplink::position::Position;
/// use geo_uplink::protocol::formatter::format_position;
///
/// let position = Position::new(Utc::now(), 10.0, 20.0).with_speed(5.0);
/// let request = format_position(&position, "123456", "https://example.com/report", None)?;
/// assert!(request.url().contains("id=123456&lat=10.0&lon=20.0&speed=5"));
/// # Ok::<(), geo_uplink::error::FormatError>(())
/// ```
pub fn format_position(
    position: &Position,
    device_id: &str,
    base_url: &str,
    alarm: Option<&str>,
) -> Result<RequestDescriptor, FormatError> {
    let mut url = parse_base_url(base_url)?;
    let battery = position.battery();

    {
        let mut query = url.query_pairs_mut();
        query
            .append_pair(PARAM_DEVICE_ID, device_id)
            .append_pair(PARAM_LATITUDE, &format_coordinate(position.latitude()))
            .append_pair(PARAM_LONGITUDE, &format_coordinate(position.longitude()))
            .append_pair(PARAM_SPEED, &format_number(position.speed()))
            .append_pair(PARAM_TIMESTAMP, &position.time().timestamp().to_string())
            .append_pair(PARAM_ALTITUDE, &format_number(position.altitude()))
            .append_pair(PARAM_BEARING, &format_number(position.bearing()))
            .append_pair(PARAM_ACCURACY, &format_number(position.accuracy()))
            .append_pair(PARAM_BATTERY, &format_number(battery.level))
            .append_pair(PARAM_CHARGE, if battery.charging { "true" } else { "false" });

        if let Some(alarm) = alarm {
            query.append_pair(PARAM_ALARM, alarm);
        }
    }

    Ok(RequestDescriptor::new(url.into()))
}

/// Validate and parse a server base URL
///
/// # Errors
///
/// Returns `InvalidUrl` when the text does not parse as an absolute URL and
/// `MissingHost` when it parses but names no host.
pub fn parse_base_url(base_url: &str) -> Result<Url, FormatError> {
    let url = Url::parse(base_url.trim()).map_err(|e| FormatError::InvalidUrl {
        url: base_url.to_string(),
        reason: e.to_string(),
    })?;

    if url.cannot_be_a_base() || url.host_str().map_or(true, str::is_empty) {
        return Err(FormatError::MissingHost(base_url.to_string()));
    }

    Ok(url)
}

/// Format a coordinate, always keeping a decimal point
///
/// Rust's float `Display` never uses exponents or grouping separators, so
/// the output is locale-independent. Whole degrees get a trailing `.0`.
pub fn format_coordinate(value: f64) -> String {
    let text = value.to_string();
    if value.is_finite() && !text.contains('.') {
        format!("{}.0", text)
    } else {
        text
    }
}

/// Format a measurement with the shortest exact decimal text (`5`, `12.5`)
pub fn format_number(value: f64) -> String {
    value.to_string()
}
