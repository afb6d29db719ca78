//! Signal Quality Analysis
//!
//! Stage 5: Ku-band downlink budget over the optimized pools. Free-space
//! path loss from the slant range, atmospheric attenuation from a zenith
//! value scaled by air mass, and the 3GPP measurement triplet (RSRP, RSRQ,
//! SINR) per connectable timestamp. The strongest satellite per timestamp
//! is marked serving for the handover stage.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod link_budget;
pub mod processor;

pub use link_budget::{LinkBudget, LinkBudgetParams};
pub use processor::{Stage5Config, Stage5Executor, Stage5Processor};

/// 3GPP RSRP reporting range, dBm.
pub const RSRP_MIN_DBM: f64 = -156.0;
pub const RSRP_MAX_DBM: f64 = -31.0;

/// SINR sanity band, dB.
pub const SINR_MIN_DB: f64 = -23.0;
pub const SINR_MAX_DB: f64 = 40.0;

/// One signal measurement at a connectable timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalSample {
    pub timestamp: DateTime<Utc>,
    pub elevation_deg: f64,
    pub distance_km: f64,
    pub fspl_db: f64,
    pub atmospheric_loss_db: f64,
    pub rsrp_dbm: f64,
    pub rsrq_db: f64,
    pub sinr_db: f64,
}

impl SignalSample {
    pub fn is_finite(&self) -> bool {
        [
            self.elevation_deg,
            self.distance_km,
            self.fspl_db,
            self.atmospheric_loss_db,
            self.rsrp_dbm,
            self.rsrq_db,
            self.sinr_db,
        ]
        .iter()
        .all(|v| v.is_finite())
    }
}
