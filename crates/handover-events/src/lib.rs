//! Handover Event Detection
//!
//! Stage 6: walks the stage-5 signal timeline and raises the 3GPP NTN
//! measurement events — A3 (neighbor better than serving by an offset),
//! A4 (neighbor above absolute threshold), A5 (serving below threshold 1
//! while a neighbor exceeds threshold 2), and D2 (distance-based, serving
//! far while a neighbor is near). A3 entry requires the condition to hold
//! for a time-to-trigger run and releases through hysteresis, so a
//! measurement flickering around the offset cannot chatter.
//!
//! The emitted dataset is the chronological event log plus one state
//! record per grid timestamp, shaped for offline reinforcement-learning
//! work.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod events;
pub mod processor;

pub use events::{EventDetector, EventParams};
pub use processor::{Stage6Config, Stage6Executor, Stage6Processor};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventType {
    A3,
    A4,
    A5,
    D2,
}

/// One raised measurement event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandoverEvent {
    pub event_type: EventType,
    pub entry_time: DateTime<Utc>,
    pub exit_time: Option<DateTime<Utc>>,
    pub serving_id: String,
    pub neighbor_id: String,
    pub serving_rsrp_dbm: f64,
    pub neighbor_rsrp_dbm: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub serving_distance_km: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub neighbor_distance_km: Option<f64>,
}

/// Per-timestamp snapshot for the research dataset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateRecord {
    pub timestamp: DateTime<Utc>,
    pub serving_id: Option<String>,
    pub serving_rsrp_dbm: Option<f64>,
    /// Connectable pool satellites at this timestamp.
    pub candidates: Vec<CandidateMeasurement>,
    pub active_events: Vec<EventType>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateMeasurement {
    pub satellite_id: String,
    pub rsrp_dbm: f64,
    pub distance_km: f64,
}
