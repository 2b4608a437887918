/// Mean Earth radius used for all distance calculations (meters)
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Great-circle distance in meters between two WGS84 points (degrees).
///
/// NaN inputs propagate to a NaN result; callers validate coordinates.
pub fn haversine_distance(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let d_lat = (lat2 - lat1).to_radians();
    let d_lon = (lon2 - lon1).to_radians();
    let a = (d_lat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (d_lon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).max(0.0).sqrt());
    EARTH_RADIUS_M * c
}

/// Average ground speed in km/h between two fixes.
///
/// Returns None when the time delta is not strictly positive.
pub fn speed_kmh_between(
    from: (f64, f64, f64),
    to: (f64, f64, f64),
) -> Option<f64> {
    let (lat1, lon1, t1) = from;
    let (lat2, lon2, t2) = to;
    let dt = t2 - t1;
    if !(dt > 0.0) {
        return None;
    }
    let meters = haversine_distance(lat1, lon1, lat2, lon2);
    Some(meters / dt * 3.6)
}

/// Offset a point north/east by the given meters (small-distance approximation)
pub fn offset_meters(lat: f64, lon: f64, north_m: f64, east_m: f64) -> (f64, f64) {
    let d_lat = north_m / EARTH_RADIUS_M;
    let d_lon = east_m / (EARTH_RADIUS_M * lat.to_radians().cos());
    (lat + d_lat.to_degrees(), lon + d_lon.to_degrees())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_zero_distance() {
        assert_eq!(haversine_distance(28.6139, 77.2090, 28.6139, 77.2090), 0.0);
    }

    #[test]
    fn test_known_distance() {
        // One degree of latitude on a 6371 km sphere
        let d = haversine_distance(0.0, 0.0, 1.0, 0.0);
        assert_relative_eq!(d, 111_194.93, epsilon = 0.5);
    }

    #[test]
    fn test_symmetric() {
        let a = haversine_distance(51.5007, -0.1246, 40.6892, -74.0445);
        let b = haversine_distance(40.6892, -74.0445, 51.5007, -0.1246);
        assert_relative_eq!(a, b, epsilon = 1e-6);
        assert_relative_eq!(a, 5_574_840.0, max_relative = 0.001);
    }

    #[test]
    fn test_nan_propagates() {
        assert!(haversine_distance(f64::NAN, 0.0, 0.0, 0.0).is_nan());
    }

    #[test]
    fn test_offset_roundtrips_distance() {
        let (lat, lon) = offset_meters(12.9716, 77.5946, 6.0, 8.0);
        let d = haversine_distance(12.9716, 77.5946, lat, lon);
        assert_relative_eq!(d, 10.0, epsilon = 0.01);
    }

    #[test]
    fn test_speed_between() {
        let (lat, lon) = offset_meters(10.0, 10.0, 100.0, 0.0);
        let speed = speed_kmh_between((10.0, 10.0, 0.0), (lat, lon, 10.0)).unwrap();
        assert_relative_eq!(speed, 36.0, epsilon = 0.01);
        assert!(speed_kmh_between((10.0, 10.0, 5.0), (lat, lon, 5.0)).is_none());
    }
}
