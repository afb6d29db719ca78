//! Topocentric look angles from the ground station.
//!
//! The station-to-satellite vector is rotated from ECEF into the station's
//! East-North-Up tangent plane; elevation and azimuth come straight out of
//! the ENU components and the slant range is the vector magnitude.

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use crate::geodetic::{geodetic_to_ecef, Geodetic};

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LookAngles {
    pub elevation_deg: f64,
    /// Clockwise from North, [0, 360).
    pub azimuth_deg: f64,
    pub slant_range_km: f64,
}

/// Look angles from a geodetic station to a satellite ECEF position in
/// meters.
pub fn look_angles(station: &Geodetic, satellite_ecef_m: Vector3<f64>) -> LookAngles {
    let station_ecef = geodetic_to_ecef(station);
    let delta = satellite_ecef_m - station_ecef;

    let lat = station.latitude_deg.to_radians();
    let lon = station.longitude_deg.to_radians();
    let (sin_lat, cos_lat) = lat.sin_cos();
    let (sin_lon, cos_lon) = lon.sin_cos();

    let east = -sin_lon * delta.x + cos_lon * delta.y;
    let north = -sin_lat * cos_lon * delta.x - sin_lat * sin_lon * delta.y + cos_lat * delta.z;
    let up = cos_lat * cos_lon * delta.x + cos_lat * sin_lon * delta.y + sin_lat * delta.z;

    let range_m = delta.norm();
    let elevation_deg = (up / range_m).asin().to_degrees();
    let azimuth = east.atan2(north).to_degrees();
    let azimuth_deg = if azimuth < 0.0 { azimuth + 360.0 } else { azimuth };

    LookAngles {
        elevation_deg,
        // Guard the boundary: atan2 may land exactly on 360 after the wrap.
        azimuth_deg: if azimuth_deg >= 360.0 { 0.0 } else { azimuth_deg },
        slant_range_km: range_m / 1000.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn station() -> Geodetic {
        Geodetic::new(
            pipeline_core::GROUND_STATION_LAT_DEG,
            pipeline_core::GROUND_STATION_LON_DEG,
            pipeline_core::GROUND_STATION_ALT_M,
        )
    }

    #[test]
    fn test_zenith_pass() {
        let overhead = Geodetic::new(
            station().latitude_deg,
            station().longitude_deg,
            550_000.0,
        );
        let angles = look_angles(&station(), geodetic_to_ecef(&overhead));
        assert!(angles.elevation_deg > 89.9, "elevation {}", angles.elevation_deg);
        assert!((angles.slant_range_km - 550.0).abs() < 1.0);
    }

    #[test]
    fn test_northern_satellite_bearing() {
        // A satellite due north of the station shows azimuth ≈ 0/360.
        let north = Geodetic::new(
            station().latitude_deg + 5.0,
            station().longitude_deg,
            550_000.0,
        );
        let angles = look_angles(&station(), geodetic_to_ecef(&north));
        assert!(angles.azimuth_deg < 1.0 || angles.azimuth_deg > 359.0);
        assert!(angles.elevation_deg > 0.0 && angles.elevation_deg < 90.0);
    }

    #[test]
    fn test_below_horizon_negative_elevation() {
        // Antipodal satellite is far below the horizon.
        let antipode = Geodetic::new(-24.9438889, -58.6291667, 550_000.0);
        let angles = look_angles(&station(), geodetic_to_ecef(&antipode));
        assert!(angles.elevation_deg < 0.0);
        assert!((0.0..360.0).contains(&angles.azimuth_deg));
    }
}
