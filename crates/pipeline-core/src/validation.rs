//! Two-layer validation framework.
//!
//! Layer 1 runs inside the producing processor and verifies domain
//! invariants of the payload it just built; it writes a
//! [`ValidationSnapshot`] to disk. Layer 2 is a stateless check of the
//! snapshot itself: it trusts Layer 1 for correctness and looks only at
//! structural and statistical sanity against fixed per-stage thresholds.
//! The snapshot file is the only contract between the two layers, and it is
//! never mutated after write.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::context::RuntimeContext;
use crate::error::{PipelineError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Passed,
    Failed,
    NotApplicable,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationDetails {
    pub success_rate: f64,
    pub checks_performed: usize,
    pub checks_passed: usize,
    pub check_results: BTreeMap<String, CheckStatus>,
}

/// On-disk snapshot, one per stage, at
/// `validation_snapshots/stageN_validation.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationSnapshot {
    pub stage: u8,
    pub stage_name: String,
    pub status: String,
    pub validation_passed: bool,
    pub timestamp: String,
    pub data_summary: Value,
    pub metadata: Value,
    pub satellites_sample: Vec<Value>,
    pub validation_details: ValidationDetails,
}

/// At most this many satellite records are embedded for auditing.
pub const SNAPSHOT_SAMPLE_LIMIT: usize = 20;

/// Layer-1 report builder. Each named check lands in the snapshot.
#[derive(Debug, Clone)]
pub struct ValidationReport {
    pub stage: u8,
    pub stage_name: String,
    checks: BTreeMap<String, CheckStatus>,
    messages: Vec<String>,
}

impl ValidationReport {
    pub fn new(stage: u8, stage_name: &str) -> Self {
        Self {
            stage,
            stage_name: stage_name.to_string(),
            checks: BTreeMap::new(),
            messages: Vec::new(),
        }
    }

    /// Record a named check; failures carry a human-readable message.
    pub fn record(&mut self, name: &str, passed: bool, failure_message: impl Into<String>) {
        let status = if passed {
            CheckStatus::Passed
        } else {
            let msg = failure_message.into();
            warn!("stage {} check {name} failed: {msg}", self.stage);
            self.messages.push(format!("{name}: {msg}"));
            CheckStatus::Failed
        };
        self.checks.insert(name.to_string(), status);
    }

    pub fn record_not_applicable(&mut self, name: &str) {
        self.checks
            .insert(name.to_string(), CheckStatus::NotApplicable);
    }

    pub fn passed(&self) -> bool {
        !self
            .checks
            .values()
            .any(|s| matches!(s, CheckStatus::Failed))
    }

    pub fn messages(&self) -> &[String] {
        &self.messages
    }

    pub fn first_failure(&self) -> Option<&str> {
        self.messages.first().map(|s| s.as_str())
    }

    pub fn details(&self) -> ValidationDetails {
        let applicable = self
            .checks
            .values()
            .filter(|s| !matches!(s, CheckStatus::NotApplicable))
            .count();
        let passed = self
            .checks
            .values()
            .filter(|s| matches!(s, CheckStatus::Passed))
            .count();
        let success_rate = if applicable == 0 {
            1.0
        } else {
            passed as f64 / applicable as f64
        };
        ValidationDetails {
            success_rate,
            checks_performed: self.checks.len(),
            checks_passed: passed,
            check_results: self.checks.clone(),
        }
    }

    /// Assemble the snapshot around this report.
    pub fn into_snapshot(
        self,
        data_summary: Value,
        metadata: Value,
        satellites_sample: Vec<Value>,
    ) -> ValidationSnapshot {
        let passed = self.passed();
        let mut sample = satellites_sample;
        sample.truncate(SNAPSHOT_SAMPLE_LIMIT);
        ValidationSnapshot {
            stage: self.stage,
            stage_name: self.stage_name.clone(),
            status: if passed { "success" } else { "failed" }.to_string(),
            validation_passed: passed,
            timestamp: Utc::now().to_rfc3339(),
            data_summary,
            metadata,
            satellites_sample: sample,
            validation_details: self.details(),
        }
    }
}

pub fn snapshot_path(ctx: &RuntimeContext, stage: u8) -> PathBuf {
    ctx.snapshot_dir().join(format!("stage{stage}_validation.json"))
}

pub fn write_snapshot(ctx: &RuntimeContext, snapshot: &ValidationSnapshot) -> Result<PathBuf> {
    let dir = ctx.snapshot_dir();
    fs::create_dir_all(&dir)?;
    let path = snapshot_path(ctx, snapshot.stage);
    let text = serde_json::to_string_pretty(snapshot)?;
    fs::write(&path, text)?;
    Ok(path)
}

pub fn read_snapshot(ctx: &RuntimeContext, stage: u8) -> Result<ValidationSnapshot> {
    let path = snapshot_path(ctx, stage);
    let text = fs::read_to_string(&path).map_err(|e| {
        PipelineError::Resource(format!("snapshot {}: {e}", path.display()))
    })?;
    Ok(serde_json::from_str(&text)?)
}

/// Layer 2: stateless external snapshot check.
pub mod external {
    use super::*;

    /// Structural + statistical sanity for a stage snapshot. Returns the
    /// verdict and a one-line human-readable message.
    pub fn validate_snapshot(stage: u8, snap: &ValidationSnapshot) -> (bool, String) {
        if snap.stage != stage {
            return (
                false,
                format!("snapshot stage {} does not match stage {stage}", snap.stage),
            );
        }
        if snap.status != "success" || !snap.validation_passed {
            let failing = snap
                .validation_details
                .check_results
                .iter()
                .find(|(_, s)| matches!(s, CheckStatus::Failed))
                .map(|(n, _)| n.clone())
                .unwrap_or_else(|| "unknown".to_string());
            return (false, format!("layer-1 validation failed: check {failing}"));
        }
        if chrono::DateTime::parse_from_rfc3339(&snap.timestamp).is_err() {
            return (false, "snapshot timestamp is not ISO-8601".to_string());
        }
        let d = &snap.validation_details;
        if d.checks_performed < 6 || d.checks_performed > 15 {
            return (
                false,
                format!("expected 6-15 named checks, snapshot has {}", d.checks_performed),
            );
        }
        if d.success_rate < 1.0 - 1e-9 {
            return (
                false,
                format!("success rate {:.3} below 1.0 with passing status", d.success_rate),
            );
        }
        let count = snap
            .data_summary
            .get("satellite_count")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        if count == 0 {
            return (false, "data_summary.satellite_count missing or zero".to_string());
        }
        for key in required_summary_keys(stage) {
            if snap.data_summary.get(key).is_none() {
                return (false, format!("data_summary missing key {key}"));
            }
        }

        (true, format!("stage {stage} snapshot ok ({count} satellites)"))
    }

    /// Stage-specific checklist over the data summary.
    fn required_summary_keys(stage: u8) -> &'static [&'static str] {
        match stage {
            1 => &["satellite_count", "constellations"],
            2 => &["satellite_count", "time_points", "position_range_km"],
            3 => &["satellite_count", "altitude_range_km", "elevation_range_deg"],
            4 => &["satellite_count", "candidate_counts", "coverage_rates"],
            5 => &["satellite_count", "rsrp_range_dbm"],
            6 => &["satellite_count", "event_count", "state_records"],
            _ => &["satellite_count"],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::EnvOverrides;
    use serde_json::json;

    fn sample_report() -> ValidationReport {
        let mut report = ValidationReport::new(2, "orbital_propagation");
        for name in [
            "input_schema",
            "satellite_count_ratio",
            "time_series_length",
            "position_magnitude",
            "velocity_magnitude",
            "no_nan_values",
        ] {
            report.record(name, true, "");
        }
        report
    }

    #[test]
    fn test_report_success_rate() {
        let mut report = sample_report();
        report.record("orbital_period_starlink", false, "period 97.2 min out of band");
        report.record_not_applicable("orbital_period_oneweb");

        assert!(!report.passed());
        let details = report.details();
        assert_eq!(details.checks_performed, 8);
        assert_eq!(details.checks_passed, 6);
        assert!((details.success_rate - 6.0 / 7.0).abs() < 1e-12);
    }

    #[test]
    fn test_snapshot_round_trip_preserves_verdict() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = RuntimeContext::with_env(tmp.path(), tmp.path(), EnvOverrides::default());

        let snap = sample_report().into_snapshot(
            json!({"satellite_count": 2, "time_points": 10, "position_range_km": [6878.0, 7578.0]}),
            json!({"standard_references": ["SGP4"]}),
            vec![json!({"satellite_id": "44713"})],
        );
        write_snapshot(&ctx, &snap).unwrap();
        let reread = read_snapshot(&ctx, 2).unwrap();

        assert_eq!(reread.stage, snap.stage);
        assert_eq!(reread.validation_passed, snap.validation_passed);
        assert_eq!(
            external::validate_snapshot(2, &snap).0,
            external::validate_snapshot(2, &reread).0
        );
    }

    #[test]
    fn test_external_rejects_failed_layer1() {
        let mut report = sample_report();
        report.record("no_nan_values", false, "NaN at index 3");
        let snap = report.into_snapshot(
            json!({"satellite_count": 2, "time_points": 10, "position_range_km": []}),
            json!({}),
            vec![],
        );
        let (ok, msg) = external::validate_snapshot(2, &snap);
        assert!(!ok);
        assert!(msg.contains("no_nan_values"));
    }

    #[test]
    fn test_sample_truncated_to_twenty() {
        let samples: Vec<Value> = (0..50).map(|i| json!({"satellite_id": i})).collect();
        let snap = sample_report().into_snapshot(json!({}), json!({}), samples);
        assert_eq!(snap.satellites_sample.len(), SNAPSHOT_SAMPLE_LIMIT);
    }
}
