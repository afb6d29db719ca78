//! Coordinate Transformation Engine
//!
//! Stage 3: converts the SGP4 TEME time series into Earth-fixed and
//! geodetic WGS84 coordinates plus topocentric look angles from the fixed
//! ground station. The bulk TEME states are read from the stage-2 HDF5
//! tensor (the JSON artifact stays the re-entrancy boundary and supplies
//! the grid, element lines, and constellation tags). The rotation chain
//! is TEME → true-of-date (equation of the equinoxes from the IAU 2000A
//! nutation series) → pseudo-Earth-fixed (apparent sidereal time from
//! UT1) → ECEF (IERS polar motion). No spherical-Earth shortcut anywhere.
//!
//! The whole stage output is content-addressed: a SHA-256 over the input
//! satellite set, the time grid, and the stage config keys an HDF5 cache
//! that short-circuits recomputation on repeat runs.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod cache;
pub mod geodetic;
pub mod iers;
pub mod nutation;
pub mod processor;
pub mod rotation;
pub mod time;
pub mod topocentric;

pub use geodetic::{ecef_to_geodetic, geodetic_to_ecef, Geodetic};
pub use processor::{Stage3Config, Stage3Executor, Stage3Processor};
pub use topocentric::{look_angles, LookAngles};

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("geodetic conversion failed: {0}")]
    Geodetic(String),
    #[error("IERS data unavailable: {0}")]
    Iers(String),
    #[error("time scale error: {0}")]
    TimeScale(String),
}

pub type Result<T> = std::result::Result<T, FrameError>;

/// WGS84 ellipsoid.
pub const WGS84_A_M: f64 = 6_378_137.0;
pub const WGS84_F: f64 = 1.0 / 298.257223563;
pub const WGS84_B_M: f64 = WGS84_A_M * (1.0 - WGS84_F);
pub const WGS84_E2: f64 = WGS84_F * (2.0 - WGS84_F);

/// Valid altitude band for the LEO catalogs, meters.
pub const MIN_ALTITUDE_M: f64 = 150_000.0;
pub const MAX_ALTITUDE_M: f64 = 2_500_000.0;

/// One transformed sample: geodetic position plus look angles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeodeticState {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub position: GeodeticPosition,
    pub ecef: EcefKm,
    pub visibility_metrics: VisibilityMetrics,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct GeodeticPosition {
    pub lat: f64,
    pub lon: f64,
    pub alt_km: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct EcefKm {
    pub x_km: f64,
    pub y_km: f64,
    pub z_km: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct VisibilityMetrics {
    pub elevation_deg: f64,
    pub azimuth_deg: f64,
    pub distance_km: f64,
    pub is_connectable: bool,
    pub threshold_applied: f64,
}
