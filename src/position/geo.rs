//! Great-circle distance between fixes.

/// Mean Earth radius in metres
pub const EARTH_RADIUS_M: f64 = 6_371_008.8;

/// Calculate the great-circle distance between two coordinates.
///
/// Uses the haversine formula, which is accurate over the short
/// displacements the distance filter compares.
///
/// # Arguments
///
/// * `from` - First position as (latitude, longitude) in degrees
/// * `to` - Second position as (latitude, longitude) in degrees
///
/// # Returns
///
/// Distance in metres.
///
/// # Example
///
/// ```
/// use geo_uplink::position::geo::distance_m;
///
/// // One degree of latitude is ~111 km
/// let dist = distance_m((0.0, 0.0), (1.0, 0.0));
/// assert!((dist - 111_195.0).abs() < 100.0);
/// ```
pub fn distance_m(from: (f64, f64), to: (f64, f64)) -> f64 {
    let (lat1, lon1) = from;
    let (lat2, lon2) = to;

    let lat1_rad = lat1.to_radians();
    let lat2_rad = lat2.to_radians();
    let delta_lat = (lat2 - lat1).to_radians();
    let delta_lon = (lon2 - lon1).to_radians();

    let a = (delta_lat / 2.0).sin().powi(2)
        + lat1_rad.cos() * lat2_rad.cos() * (delta_lon / 2.0).sin().powi(2);
    // Rounding can push `a` past 1 for near-antipodal points
    let c = 2.0 * a.clamp(0.0, 1.0).sqrt().asin();

    EARTH_RADIUS_M * c
}
