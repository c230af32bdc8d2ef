// Geodesy module - great-circle distances and coordinate normalization
//
// All positions are (latitude, longitude) in degrees on a spherical Earth.
// Distances are in kilometers; the pipeline never needs an altitude
// dimension, so no ellipsoid model is carried.

use std::f64::consts::PI;

use serde::{Deserialize, Serialize};

/// Degrees to radians conversion factor
const DTOR: f64 = PI / 180.0;

/// Mean Earth radius in kilometers for the spherical approximation
pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// A point on the Earth's surface, in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

impl GeoPoint {
    pub fn new(lat: f64, lon: f64) -> Self {
        GeoPoint { lat, lon }
    }
}

/// Returns the haversine (great-circle) distance in kilometers between two
/// points.
///
/// Accuracy is ~0.5% against the ellipsoid, which is well below the noise
/// floor of delay-derived distances.
///
/// # Example
/// ```
/// use geodelay::geodesy::{haversine_km, GeoPoint};
/// let d = haversine_km(GeoPoint::new(51.5, -0.1), GeoPoint::new(48.8, 2.3));
/// assert!((d - 345.0).abs() < 10.0); // London to Paris
/// ```
pub fn haversine_km(a: GeoPoint, b: GeoPoint) -> f64 {
    let lat1 = a.lat * DTOR;
    let lat2 = b.lat * DTOR;
    let dlat = (b.lat - a.lat) * DTOR;
    let dlon = (b.lon - a.lon) * DTOR;

    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    let c = 2.0 * h.sqrt().atan2((1.0 - h).sqrt());

    EARTH_RADIUS_KM * c
}

/// Wraps an arbitrary coordinate into lat ∈ [-90, 90], lon ∈ (-180, 180].
///
/// Latitudes past a pole reflect across it and shift the longitude by 180°,
/// so (91, 0) normalizes to (89, 180). The solver runs unconstrained and its
/// raw output is wrapped here afterward; bounding the optimizer itself pins
/// estimates to the box edges.
///
/// Idempotent: normalizing an already-normalized point returns it unchanged.
pub fn normalize(p: GeoPoint) -> GeoPoint {
    let mut lat = (p.lat + 90.0).rem_euclid(360.0) - 90.0;
    let mut lon = p.lon;
    if lat > 90.0 {
        lat = 180.0 - lat;
        lon += 180.0;
    }
    let lon = 180.0 - (180.0 - lon).rem_euclid(360.0);
    GeoPoint { lat, lon }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPSILON: f64 = 1e-9;

    #[test]
    fn test_haversine_symmetry() {
        let a = GeoPoint::new(51.5074, -0.1278); // London
        let b = GeoPoint::new(35.6893, 139.6899); // Tokyo
        assert!((haversine_km(a, b) - haversine_km(b, a)).abs() < EPSILON);
    }

    #[test]
    fn test_haversine_same_point() {
        let p = GeoPoint::new(-23.5335, -46.6359);
        assert!(haversine_km(p, p).abs() < EPSILON);
    }

    #[test]
    fn test_haversine_london_paris() {
        let d = haversine_km(
            GeoPoint::new(51.5074, -0.1278),
            GeoPoint::new(48.8566, 2.3522),
        );
        // Roughly 344 km
        assert!((d - 344.0).abs() < 5.0, "distance: {} km", d);
    }

    #[test]
    fn test_haversine_antipodal() {
        let d = haversine_km(GeoPoint::new(0.0, 0.0), GeoPoint::new(0.0, 180.0));
        assert!((d - PI * EARTH_RADIUS_KM).abs() < 1e-6);
    }

    #[test]
    fn test_normalize_identity() {
        let points = [
            GeoPoint::new(0.0, 0.0),
            GeoPoint::new(5.0, 5.0),
            GeoPoint::new(-90.0, 0.0),
            GeoPoint::new(89.0, 180.0),
            GeoPoint::new(45.0, -179.9),
        ];
        for p in points {
            let n = normalize(p);
            assert!((n.lat - p.lat).abs() < EPSILON && (n.lon - p.lon).abs() < EPSILON);
            // Idempotent
            let n2 = normalize(n);
            assert!((n2.lat - n.lat).abs() < EPSILON && (n2.lon - n.lon).abs() < EPSILON);
        }
    }

    #[test]
    fn test_normalize_pole_reflection() {
        let n = normalize(GeoPoint::new(91.0, 0.0));
        assert!((n.lat - 89.0).abs() < EPSILON);
        assert!((n.lon - 180.0).abs() < EPSILON);

        let s = normalize(GeoPoint::new(-91.0, 0.0));
        assert!((s.lat + 89.0).abs() < EPSILON);
        assert!((s.lon - 180.0).abs() < EPSILON);
    }

    #[test]
    fn test_normalize_longitude_wrap() {
        let n = normalize(GeoPoint::new(10.0, 190.0));
        assert!((n.lat - 10.0).abs() < EPSILON);
        assert!((n.lon + 170.0).abs() < EPSILON);

        let w = normalize(GeoPoint::new(10.0, -540.0));
        assert!((w.lon - 180.0).abs() < EPSILON);
    }

    #[test]
    fn test_normalize_far_out_of_range() {
        // A full wrap plus pole overshoot
        let n = normalize(GeoPoint::new(451.0, 10.0)); // 451 = 360 + 91
        assert!((n.lat - 89.0).abs() < EPSILON);
        assert!((n.lon + 170.0).abs() < EPSILON);
    }
}
