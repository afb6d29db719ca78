//! Orbital Propagation Engine
//!
//! Stage 2: propagates every cataloged satellite across the shared
//! observation window with SGP4. The window is one time grid for all
//! satellites (research comparability), while each satellite propagates
//! from its own TLE epoch via `Δt = t − epoch`. Satellites are
//! embarrassingly parallel; workers return partial maps that the
//! coordinator merges in NORAD-id order so downstream output is
//! reproducible.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use tle_ingest::Constellation;

pub mod h5;
pub mod processor;
pub mod propagator;
pub mod time_grid;

pub use processor::{Stage2Config, Stage2Executor, Stage2Processor};
pub use propagator::Sgp4Propagator;
pub use time_grid::TimeGrid;

#[derive(Error, Debug)]
pub enum PropagationError {
    #[error("invalid TLE: {0}")]
    InvalidTle(String),
    #[error("propagation failed: {0}")]
    PropagationFailed(String),
    #[error("non-finite state at {0}")]
    NonFiniteState(String),
}

pub type Result<T> = std::result::Result<T, PropagationError>;

/// LEO sanity band for |position| in km (earth radius + 150–2,500 km).
pub const MIN_POSITION_KM: f64 = 6_500.0;
pub const MAX_POSITION_KM: f64 = 9_000.0;

/// LEO sanity band for |velocity| in km/s.
pub const MIN_VELOCITY_KM_S: f64 = 5.0;
pub const MAX_VELOCITY_KM_S: f64 = 9.0;

/// Satellites whose epoch is further than this from the window center are
/// dropped with a staleness warning.
pub const EPOCH_STALENESS_DAYS: i64 = 7;

/// One TEME state on the shared grid.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrbitalState {
    pub timestamp: DateTime<Utc>,
    pub minutes_since_epoch: f64,
    /// TEME position, km.
    pub x: f64,
    pub y: f64,
    pub z: f64,
    /// TEME velocity, km/s.
    pub vx: f64,
    pub vy: f64,
    pub vz: f64,
}

impl OrbitalState {
    pub fn position_magnitude(&self) -> f64 {
        (self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }

    pub fn velocity_magnitude(&self) -> f64 {
        (self.vx * self.vx + self.vy * self.vy + self.vz * self.vz).sqrt()
    }

    pub fn is_finite(&self) -> bool {
        [self.x, self.y, self.z, self.vx, self.vy, self.vz, self.minutes_since_epoch]
            .iter()
            .all(|v| v.is_finite())
    }
}

/// Full time series for one satellite.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SatelliteTrack {
    pub constellation: Constellation,
    pub time_series: Vec<OrbitalState>,
}
