//! ECEF ↔ WGS84 geodetic conversion.
//!
//! The inverse conversion iterates on the geodetic latitude until the
//! update is below one millimeter on the ellipsoid, capped at ten rounds.

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use crate::{FrameError, Result, MAX_ALTITUDE_M, MIN_ALTITUDE_M, WGS84_A_M, WGS84_B_M, WGS84_E2};

/// Convergence bound for the latitude iteration, meters of arc.
pub const CONVERGENCE_M: f64 = 0.001;
pub const MAX_ITERATIONS: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Geodetic {
    pub latitude_deg: f64,
    pub longitude_deg: f64,
    pub altitude_m: f64,
}

impl Geodetic {
    pub fn new(latitude_deg: f64, longitude_deg: f64, altitude_m: f64) -> Self {
        Self {
            latitude_deg,
            longitude_deg,
            altitude_m,
        }
    }

    pub fn in_valid_ranges(&self) -> bool {
        (-90.0..=90.0).contains(&self.latitude_deg)
            && (-180.0..=180.0).contains(&self.longitude_deg)
            && self.latitude_deg.is_finite()
            && self.longitude_deg.is_finite()
            && self.altitude_m.is_finite()
    }

    /// Altitude inside the LEO catalog band.
    pub fn in_leo_band(&self) -> bool {
        (MIN_ALTITUDE_M..=MAX_ALTITUDE_M).contains(&self.altitude_m)
    }
}

/// Geodetic position to ECEF, meters.
pub fn geodetic_to_ecef(pos: &Geodetic) -> Vector3<f64> {
    let lat = pos.latitude_deg.to_radians();
    let lon = pos.longitude_deg.to_radians();
    let sin_lat = lat.sin();
    let cos_lat = lat.cos();

    // Radius of curvature in the prime vertical.
    let n = WGS84_A_M / (1.0 - WGS84_E2 * sin_lat * sin_lat).sqrt();

    Vector3::new(
        (n + pos.altitude_m) * cos_lat * lon.cos(),
        (n + pos.altitude_m) * cos_lat * lon.sin(),
        (n * (1.0 - WGS84_E2) + pos.altitude_m) * sin_lat,
    )
}

/// ECEF (meters) to geodetic, iterating to ≤ 1 mm or ten rounds.
pub fn ecef_to_geodetic(ecef: Vector3<f64>) -> Result<Geodetic> {
    let (x, y, z) = (ecef.x, ecef.y, ecef.z);
    if !(x.is_finite() && y.is_finite() && z.is_finite()) {
        return Err(FrameError::Geodetic("non-finite ECEF input".to_string()));
    }

    let p = (x * x + y * y).sqrt();
    if p < 1e-6 {
        // Polar axis: latitude is ±90°, altitude against the semi-minor axis.
        let latitude_deg = if z >= 0.0 { 90.0 } else { -90.0 };
        return Ok(Geodetic::new(latitude_deg, 0.0, z.abs() - WGS84_B_M));
    }

    let longitude_deg = normalize_longitude(y.atan2(x).to_degrees());

    let mut lat = (z / (p * (1.0 - WGS84_E2))).atan();
    let mut alt = 0.0;
    for _ in 0..MAX_ITERATIONS {
        let sin_lat = lat.sin();
        let n = WGS84_A_M / (1.0 - WGS84_E2 * sin_lat * sin_lat).sqrt();
        alt = p / lat.cos() - n;
        let next = (z / (p * (1.0 - WGS84_E2 * n / (n + alt)))).atan();
        let converged = (next - lat).abs() * (n + alt) < CONVERGENCE_M;
        lat = next;
        if converged {
            break;
        }
    }

    Ok(Geodetic::new(lat.to_degrees(), longitude_deg, alt))
}

/// Wrap into (−180, 180].
pub fn normalize_longitude(lon_deg: f64) -> f64 {
    let mut lon = lon_deg.rem_euclid(360.0);
    if lon > 180.0 {
        lon -= 360.0;
    }
    lon
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equator_prime_meridian() {
        let ecef = geodetic_to_ecef(&Geodetic::new(0.0, 0.0, 0.0));
        assert!((ecef.x - WGS84_A_M).abs() < 1e-6);
        assert!(ecef.y.abs() < 1e-6);
        assert!(ecef.z.abs() < 1e-6);
    }

    #[test]
    fn test_round_trip_millimeter() {
        // Altitude band from below the geoid to beyond LEO.
        let cases = [
            Geodetic::new(24.9438889, 121.3708333, 36.0),
            Geodetic::new(-45.0, -170.0, 550_000.0),
            Geodetic::new(80.0, 10.0, 1_200_000.0),
            Geodetic::new(-10.0, 179.9, 10_000_000.0),
            Geodetic::new(52.5, -0.1, -1_000.0),
        ];
        for original in cases {
            let ecef = geodetic_to_ecef(&original);
            let back = ecef_to_geodetic(ecef).unwrap();
            let ecef_back = geodetic_to_ecef(&back);
            assert!(
                (ecef - ecef_back).norm() < 0.001,
                "round trip error {} m at {original:?}",
                (ecef - ecef_back).norm()
            );
        }
    }

    #[test]
    fn test_polar_case() {
        let pole = ecef_to_geodetic(Vector3::new(0.0, 0.0, WGS84_B_M + 500_000.0)).unwrap();
        assert_eq!(pole.latitude_deg, 90.0);
        assert!((pole.altitude_m - 500_000.0).abs() < 1e-6);
    }

    #[test]
    fn test_longitude_normalization() {
        assert_eq!(normalize_longitude(181.0), -179.0);
        assert_eq!(normalize_longitude(-180.0), 180.0);
        assert_eq!(normalize_longitude(360.0), 0.0);
    }
}
