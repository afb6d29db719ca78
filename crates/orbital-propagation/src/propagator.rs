//! SGP4 wrapper.
//!
//! Thin layer over the `sgp4` crate: parse the element pair once per
//! satellite, then emit TEME states for arbitrary UTC instants via the
//! minutes-since-epoch offset.

use chrono::{DateTime, Utc};

use crate::time_grid::TimeGrid;
use crate::{OrbitalState, PropagationError, Result};

pub struct Sgp4Propagator {
    elements: sgp4::Elements,
    epoch: DateTime<Utc>,
}

impl Sgp4Propagator {
    pub fn from_tle(line1: &str, line2: &str) -> Result<Self> {
        let elements = sgp4::Elements::from_tle(None, line1.as_bytes(), line2.as_bytes())
            .map_err(|e| PropagationError::InvalidTle(format!("{e:?}")))?;
        let epoch = DateTime::<Utc>::from_naive_utc_and_offset(elements.datetime, Utc);
        Ok(Self { elements, epoch })
    }

    pub fn epoch(&self) -> DateTime<Utc> {
        self.epoch
    }

    /// Mean motion in revolutions per day (Kozai convention).
    pub fn mean_motion(&self) -> f64 {
        self.elements.mean_motion
    }

    pub fn orbital_period_minutes(&self) -> f64 {
        1440.0 / self.elements.mean_motion
    }

    /// TEME state at a single instant.
    pub fn state_at(&self, time: DateTime<Utc>) -> Result<OrbitalState> {
        let constants = sgp4::Constants::from_elements(&self.elements)
            .map_err(|e| PropagationError::PropagationFailed(format!("{e:?}")))?;
        self.predict(&constants, time)
    }

    /// Propagate the whole grid sequentially. The SGP4 constants are
    /// derived once; within a worker this is the hot loop.
    pub fn propagate_series(&self, grid: &TimeGrid) -> Result<Vec<OrbitalState>> {
        let constants = sgp4::Constants::from_elements(&self.elements)
            .map_err(|e| PropagationError::PropagationFailed(format!("{e:?}")))?;
        let mut series = Vec::with_capacity(grid.len());
        for timestamp in grid.timestamps() {
            series.push(self.predict(&constants, timestamp)?);
        }
        Ok(series)
    }

    fn predict(&self, constants: &sgp4::Constants, time: DateTime<Utc>) -> Result<OrbitalState> {
        let minutes_since_epoch =
            time.signed_duration_since(self.epoch).num_milliseconds() as f64 / 60_000.0;
        let prediction = constants
            .propagate(minutes_since_epoch)
            .map_err(|e| PropagationError::PropagationFailed(format!("{e:?}")))?;

        let state = OrbitalState {
            timestamp: time,
            minutes_since_epoch,
            x: prediction.position[0],
            y: prediction.position[1],
            z: prediction.position[2],
            vx: prediction.velocity[0],
            vy: prediction.velocity[1],
            vz: prediction.velocity[2],
        };
        if !state.is_finite() {
            return Err(PropagationError::NonFiniteState(time.to_rfc3339()));
        }
        Ok(state)
    }
}
