//! TLE Catalog Ingest
//!
//! Stage 1 of the pipeline: loads raw Two-Line-Element catalogs, validates
//! line format and checksums, tags each satellite with its constellation,
//! and emits the stage-1 payload consumed by orbital propagation. Every
//! satellite keeps its own epoch; the pipeline never collapses the catalog
//! onto a shared calculation base time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod catalog;
pub mod processor;
pub mod synthetic;

pub use processor::{Stage1Config, Stage1Executor, Stage1Processor};

#[derive(Error, Debug)]
pub enum TleError {
    #[error("invalid TLE line length: expected 69, got {0}")]
    LineLength(usize),
    #[error("checksum mismatch on line {line}: expected {expected}, got {actual}")]
    Checksum { line: u8, expected: u8, actual: u8 },
    #[error("TLE parse failure: {0}")]
    Parse(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TleError>;

/// Constellation tag. Thresholds and pool targets are keyed on this; there
/// is no global elevation threshold anywhere in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Constellation {
    Starlink,
    OneWeb,
    Other,
}

impl Constellation {
    /// Tag from the catalog display name.
    pub fn from_name(name: &str) -> Self {
        let upper = name.to_ascii_uppercase();
        if upper.starts_with("STARLINK") {
            Self::Starlink
        } else if upper.starts_with("ONEWEB") {
            Self::OneWeb
        } else {
            Self::Other
        }
    }

    /// Per-constellation elevation mask in degrees.
    pub fn elevation_threshold_deg(&self) -> f64 {
        match self {
            Self::Starlink => pipeline_core::STARLINK_ELEVATION_THRESHOLD_DEG,
            Self::OneWeb => pipeline_core::ONEWEB_ELEVATION_THRESHOLD_DEG,
            Self::Other => pipeline_core::ONEWEB_ELEVATION_THRESHOLD_DEG,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starlink => "starlink",
            Self::OneWeb => "oneweb",
            Self::Other => "other",
        }
    }
}

/// One validated catalog entry. `epoch_datetime` is the satellite's own
/// TLE epoch at sub-second resolution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TleRecord {
    pub satellite_id: String,
    pub name: String,
    pub norad_id: u32,
    pub constellation: Constellation,
    pub tle_line1: String,
    pub tle_line2: String,
    pub epoch_datetime: DateTime<Utc>,
}

impl TleRecord {
    /// Mean motion in revolutions per day, straight from line 2.
    pub fn mean_motion(&self) -> Result<f64> {
        self.tle_line2
            .get(52..63)
            .map(str::trim)
            .and_then(|s| s.parse::<f64>().ok())
            .ok_or_else(|| TleError::Parse("mean motion field".to_string()))
    }

    /// Orbital period in minutes derived from mean motion.
    pub fn orbital_period_minutes(&self) -> Result<f64> {
        let n = self.mean_motion()?;
        if n <= 0.0 {
            return Err(TleError::Parse(format!("non-positive mean motion {n}")));
        }
        Ok(1440.0 / n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constellation_from_name() {
        assert_eq!(Constellation::from_name("STARLINK-1007"), Constellation::Starlink);
        assert_eq!(Constellation::from_name("Starlink-30000"), Constellation::Starlink);
        assert_eq!(Constellation::from_name("ONEWEB-0001"), Constellation::OneWeb);
        assert_eq!(Constellation::from_name("ISS (ZARYA)"), Constellation::Other);
    }

    #[test]
    fn test_thresholds_per_constellation() {
        assert_eq!(Constellation::Starlink.elevation_threshold_deg(), 5.0);
        assert_eq!(Constellation::OneWeb.elevation_threshold_deg(), 10.0);
    }

    #[test]
    fn test_orbital_period_from_mean_motion() {
        let record = synthetic::SyntheticTle::new(44713, "STARLINK-1007")
            .mean_motion(15.3)
            .build_record();
        let period = record.orbital_period_minutes().unwrap();
        assert!((period - 1440.0 / 15.3).abs() < 1e-6);
    }
}
