//! Shared observation window.
//!
//! One grid per run, owned by the controller's data flow and immutable:
//! a start instant, a step between 1 and 60 seconds, and a point count.
//! Timestamps are finite, strictly increasing, and unique by construction.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

pub const MIN_STEP_SECONDS: u64 = 1;
pub const MAX_STEP_SECONDS: u64 = 60;
pub const DEFAULT_STEP_SECONDS: u64 = 30;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeGrid {
    pub start: DateTime<Utc>,
    pub step_seconds: u64,
    pub point_count: usize,
}

impl TimeGrid {
    /// Build a grid, clamping the step into the supported band.
    pub fn new(start: DateTime<Utc>, step_seconds: u64, point_count: usize) -> Self {
        Self {
            start,
            step_seconds: step_seconds.clamp(MIN_STEP_SECONDS, MAX_STEP_SECONDS),
            point_count,
        }
    }

    pub fn timestamps(&self) -> impl Iterator<Item = DateTime<Utc>> + '_ {
        let step = Duration::seconds(self.step_seconds as i64);
        (0..self.point_count).map(move |i| self.start + step * (i as i32))
    }

    pub fn end(&self) -> DateTime<Utc> {
        if self.point_count == 0 {
            return self.start;
        }
        self.start + Duration::seconds((self.step_seconds * (self.point_count as u64 - 1)) as i64)
    }

    /// Midpoint of the window, used for epoch-staleness screening.
    pub fn center(&self) -> DateTime<Utc> {
        self.start + (self.end() - self.start) / 2
    }

    pub fn duration_minutes(&self) -> f64 {
        (self.end() - self.start).num_seconds() as f64 / 60.0
    }

    pub fn len(&self) -> usize {
        self.point_count
    }

    pub fn is_empty(&self) -> bool {
        self.point_count == 0
    }
}
