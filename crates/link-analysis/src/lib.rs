//! Link Feasibility Analysis
//!
//! Stage 4: per-timestamp visibility over the stage-3 geodetic series,
//! constellation-aware candidate pools with service-window summaries, and
//! the greedy Set-Cover selection of a minimum satellite pool that keeps
//! the per-timestamp visible count inside each constellation's target
//! band for at least 95% of the window.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod coverage;
pub mod processor;
pub mod set_cover;
pub mod visibility;

pub use processor::{Stage4Config, Stage4Executor, Stage4Processor};
pub use set_cover::{optimize_pool, PoolTargets, SetCoverOutcome};

/// One visibility observation from the ground station.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisibilitySample {
    pub timestamp: DateTime<Utc>,
    pub elevation_deg: f64,
    pub azimuth_deg: f64,
    pub distance_km: f64,
    pub is_connectable: bool,
}

/// Compressed description of a candidate's connectable span.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceWindow {
    pub total_connectable_minutes: f64,
    pub first_connectable: Option<DateTime<Utc>>,
    pub last_connectable: Option<DateTime<Utc>>,
    /// Longest connectable run over all connectable samples, in [0, 1].
    pub continuity_score: f64,
}

/// A satellite with at least one connectable timestamp. Carries its full
/// visibility series; pool selections reference it by satellite id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateEntry {
    pub satellite_id: String,
    pub constellation: String,
    pub service_window: ServiceWindow,
    pub visibility: Vec<VisibilitySample>,
}
