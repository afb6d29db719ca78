//! Stage 6 processor and executor.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use pipeline_core::config::load_stage_config;
use pipeline_core::error::{PipelineError, Result};
use pipeline_core::stage::{StageExecutor, StageProcessor, ValidationOutcome};
use pipeline_core::validation::{ValidationReport, ValidationSnapshot};
use pipeline_core::RuntimeContext;

use signal_analysis::SignalSample;

use crate::events::{detect, EventParams};
use crate::{CandidateMeasurement, EventType, HandoverEvent, StateRecord};

pub const STAGE_NUMBER: u8 = 6;
pub const STAGE_NAME: &str = "research_optimization";
pub const STAGE_TAG: &str = "stage6_research";
pub const UPSTREAM_TAG: &str = "stage5_signal_analysis";
pub const OUTPUT_PREFIX: &str = "stage6_research";
pub const CONFIG_FILE: &str = "stage6_research_optimization.yaml";

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Stage6Config {
    pub events: EventParams,
}

pub struct Stage6Processor {
    config: Stage6Config,
}

impl Stage6Processor {
    pub fn new(config: Stage6Config) -> Self {
        Self { config }
    }

    /// One state record per serving-timeline slot, with every pool
    /// satellite that has a measurement at that timestamp.
    fn build_records(data: &Value) -> Result<Vec<StateRecord>> {
        let timeline = data
            .get("serving_timeline")
            .and_then(Value::as_array)
            .ok_or_else(|| PipelineError::InputSchema("serving_timeline missing".to_string()))?;
        let satellites = data
            .get("satellites")
            .and_then(Value::as_object)
            .ok_or_else(|| PipelineError::InputSchema("satellites map missing".to_string()))?;

        // Timestamp → measurements across the pool.
        let mut measurements: BTreeMap<DateTime<Utc>, Vec<CandidateMeasurement>> = BTreeMap::new();
        for (id, entry) in satellites {
            let series: Vec<SignalSample> = entry
                .get("signal_series")
                .cloned()
                .map(serde_json::from_value)
                .transpose()
                .map_err(|e| PipelineError::InputSchema(format!("signal series {id}: {e}")))?
                .unwrap_or_default();
            for sample in series {
                measurements
                    .entry(sample.timestamp)
                    .or_default()
                    .push(CandidateMeasurement {
                        satellite_id: id.clone(),
                        rsrp_dbm: sample.rsrp_dbm,
                        distance_km: sample.distance_km,
                    });
            }
        }

        timeline
            .iter()
            .map(|slot| {
                let timestamp = slot
                    .get("timestamp")
                    .and_then(Value::as_str)
                    .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                    .map(|t| t.with_timezone(&Utc))
                    .ok_or_else(|| {
                        PipelineError::InputSchema("timeline timestamp unreadable".to_string())
                    })?;
                let mut candidates = measurements.remove(&timestamp).unwrap_or_default();
                candidates.sort_by(|a, b| a.satellite_id.cmp(&b.satellite_id));
                Ok(StateRecord {
                    timestamp,
                    serving_id: slot
                        .get("serving")
                        .and_then(Value::as_str)
                        .map(String::from),
                    serving_rsrp_dbm: slot.get("serving_rsrp_dbm").and_then(Value::as_f64),
                    candidates,
                    active_events: Vec::new(),
                })
            })
            .collect()
    }
}

impl StageProcessor for Stage6Processor {
    fn stage_number(&self) -> u8 {
        STAGE_NUMBER
    }

    fn stage_name(&self) -> &'static str {
        STAGE_NAME
    }

    fn validate_input(&self, data: &Value) -> ValidationOutcome {
        if data.get("stage").and_then(Value::as_str) != Some(UPSTREAM_TAG) {
            return ValidationOutcome::fail(format!("upstream payload is not {UPSTREAM_TAG}"));
        }
        match data.get("serving_timeline").and_then(Value::as_array) {
            Some(slots) if !slots.is_empty() => ValidationOutcome::ok(),
            _ => ValidationOutcome::fail("empty serving timeline"),
        }
    }

    fn process(&mut self, _ctx: &RuntimeContext, data: &Value) -> Result<Value> {
        let mut records = Self::build_records(data)?;
        let events = detect(&mut records, self.config.events.clone());
        info!(
            "detected {} events over {} state records",
            events.len(),
            records.len()
        );

        let mut event_counts: BTreeMap<String, usize> = BTreeMap::new();
        for event in &events {
            *event_counts
                .entry(format!("{:?}", event.event_type))
                .or_insert(0) += 1;
        }

        let satellite_ids: Vec<String> = data
            .get("satellites")
            .and_then(Value::as_object)
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default();

        Ok(json!({
            "stage": STAGE_TAG,
            "satellites": satellite_ids,
            "events": events,
            "state_records": records,
            "event_counts": event_counts,
            "metadata": {
                "time_window": data.pointer("/metadata/time_window"),
                "event_parameters": {
                    "a3_offset_db": self.config.events.a3_offset_db,
                    "hysteresis_db": self.config.events.hysteresis_db,
                    "time_to_trigger_steps": self.config.events.time_to_trigger_steps,
                    "a4_threshold_dbm": self.config.events.a4_threshold_dbm,
                    "a5_threshold1_dbm": self.config.events.a5_threshold1_dbm,
                    "a5_threshold2_dbm": self.config.events.a5_threshold2_dbm,
                    "d2_threshold1_km": self.config.events.d2_threshold1_km,
                    "d2_threshold2_km": self.config.events.d2_threshold2_km,
                },
            },
        }))
    }

    fn validate_output(&self, out: &Value) -> ValidationOutcome {
        match out.get("state_records").and_then(Value::as_array) {
            Some(records) if !records.is_empty() => ValidationOutcome::ok(),
            _ => ValidationOutcome::fail("no state records emitted"),
        }
    }

    fn self_validate(&self, out: &Value) -> ValidationReport {
        let mut report = ValidationReport::new(STAGE_NUMBER, STAGE_NAME);

        report.record(
            "stage_tag",
            out.get("stage").and_then(Value::as_str) == Some(STAGE_TAG),
            "stage tag mismatched",
        );

        let records: Vec<StateRecord> = out
            .get("state_records")
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default();
        let events: Vec<HandoverEvent> = out
            .get("events")
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default();
        let satellite_ids: Vec<String> = out
            .get("satellites")
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default();

        report.record("satellite_count", !satellite_ids.is_empty(), "no satellites listed");
        report.record("state_record_count", !records.is_empty(), "no state records");

        let chronological = records.windows(2).all(|w| w[0].timestamp < w[1].timestamp);
        let entries_ordered = events
            .iter()
            .all(|e| e.exit_time.map(|x| e.entry_time <= x).unwrap_or(true));
        report.record(
            "event_ordering",
            chronological && entries_ordered,
            "timestamps out of order",
        );

        let references_ok = events.iter().all(|e| {
            satellite_ids.contains(&e.serving_id) && satellite_ids.contains(&e.neighbor_id)
        });
        report.record(
            "event_references",
            references_ok,
            "event references a satellite outside the pool",
        );

        // A3 chatter guard: hysteresis forbids immediate re-entry for the
        // same neighbor.
        let mut a3_ok = true;
        let mut last_exit: BTreeMap<&str, DateTime<Utc>> = BTreeMap::new();
        let ttt_window = chrono::Duration::seconds(
            30 * self.config.events.time_to_trigger_steps.max(1) as i64,
        );
        for event in events.iter().filter(|e| e.event_type == EventType::A3) {
            if let Some(&exit) = last_exit.get(event.neighbor_id.as_str()) {
                if event.entry_time < exit + ttt_window {
                    a3_ok = false;
                }
            }
            if let Some(exit) = event.exit_time {
                last_exit.insert(event.neighbor_id.as_str(), exit);
            }
        }
        report.record("a3_hysteresis", a3_ok, "A3 re-entry inside the trigger window");

        let d2_ok = events
            .iter()
            .filter(|e| e.event_type == EventType::D2)
            .all(|e| match (e.serving_distance_km, e.neighbor_distance_km) {
                (Some(serving), Some(neighbor)) => {
                    serving > self.config.events.d2_threshold1_km
                        && neighbor < self.config.events.d2_threshold2_km
                }
                _ => false,
            });
        report.record("d2_distance_consistency", d2_ok, "D2 event violates its thresholds");

        let finite_ok = events
            .iter()
            .all(|e| e.serving_rsrp_dbm.is_finite() && e.neighbor_rsrp_dbm.is_finite())
            && records.iter().all(|r| {
                r.candidates
                    .iter()
                    .all(|c| c.rsrp_dbm.is_finite() && c.distance_km.is_finite())
            });
        report.record("no_nan_values", finite_ok, "non-finite measurement in dataset");

        report
    }

    fn build_snapshot(&self, out: &Value, report: ValidationReport) -> ValidationSnapshot {
        let records = out
            .get("state_records")
            .and_then(Value::as_array)
            .map(Vec::len)
            .unwrap_or(0);
        let events = out
            .get("events")
            .and_then(Value::as_array)
            .map(Vec::len)
            .unwrap_or(0);
        let satellite_count = out
            .get("satellites")
            .and_then(Value::as_array)
            .map(Vec::len)
            .unwrap_or(0);

        let sample: Vec<Value> = out
            .get("events")
            .and_then(Value::as_array)
            .map(|arr| arr.iter().take(20).cloned().collect())
            .unwrap_or_default();

        let data_summary = json!({
            "satellite_count": satellite_count,
            "event_count": events,
            "state_records": records,
            "event_counts": out.get("event_counts"),
        });
        let metadata = json!({
            "constellation_summary": out.get("event_counts"),
            "standard_references": ["3GPP TS 38.331 measurement events (NTN)"],
            "config": out.pointer("/metadata/event_parameters"),
        });

        report.into_snapshot(data_summary, metadata, sample)
    }
}

pub struct Stage6Executor;

impl StageExecutor for Stage6Executor {
    fn stage_number(&self) -> u8 {
        STAGE_NUMBER
    }

    fn stage_name(&self) -> &'static str {
        STAGE_NAME
    }

    fn output_prefix(&self) -> &'static str {
        OUTPUT_PREFIX
    }

    fn create_processor(&self, ctx: &RuntimeContext) -> Result<Box<dyn StageProcessor>> {
        let config: Stage6Config = load_stage_config(ctx, STAGE_NUMBER, CONFIG_FILE)?;
        Ok(Box::new(Stage6Processor::new(config)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use pipeline_core::EnvOverrides;

    fn ctx(root: &std::path::Path) -> RuntimeContext {
        RuntimeContext::with_env(root, root.join("config"), EnvOverrides::default())
    }

    fn stage5_payload() -> Value {
        let start = Utc.with_ymd_and_hms(2025, 10, 5, 12, 0, 0).unwrap();
        let ts = |i: i64| (start + Duration::seconds(30 * i)).to_rfc3339();

        let series = |rsrps: &[f64], distance: f64| -> Vec<Value> {
            rsrps
                .iter()
                .enumerate()
                .map(|(i, &rsrp_dbm)| {
                    json!({
                        "timestamp": ts(i as i64),
                        "elevation_deg": 40.0,
                        "distance_km": distance,
                        "fspl_db": 170.0 + i as f64,
                        "atmospheric_loss_db": 0.7,
                        "rsrp_dbm": rsrp_dbm,
                        "rsrq_db": -6.0,
                        "sinr_db": 10.0,
                    })
                })
                .collect()
        };

        json!({
            "stage": UPSTREAM_TAG,
            "satellites": {
                "44713": {"constellation": "starlink", "signal_series": series(&[-100.0, -100.0, -100.0, -100.0], 800.0)},
                "44714": {"constellation": "starlink", "signal_series": series(&[-99.0, -95.0, -95.0, -95.0], 900.0)},
            },
            "serving_timeline": (0..4).map(|i| json!({
                "timestamp": ts(i),
                "serving": if i == 0 { "44714" } else { "44714" },
                "serving_rsrp_dbm": if i == 0 { -99.0 } else { -95.0 },
            })).collect::<Vec<_>>(),
            "summary": {},
            "metadata": {"time_window": {"start": ts(0), "step_seconds": 30, "point_count": 4}},
        })
    }

    #[test]
    fn test_dataset_emission_and_validation() {
        let tmp = tempfile::tempdir().unwrap();
        let mut processor = Stage6Processor::new(Stage6Config::default());
        let out = processor.process(&ctx(tmp.path()), &stage5_payload()).unwrap();

        let records = out["state_records"].as_array().unwrap();
        assert_eq!(records.len(), 4);
        // Every record carries both pool measurements.
        assert_eq!(records[0]["candidates"].as_array().unwrap().len(), 2);

        let report = processor.self_validate(&out);
        assert!(report.passed(), "{:?}", report.messages());

        let snapshot = processor.build_snapshot(&out, processor.self_validate(&out));
        let (ok, msg) = pipeline_core::validation::external::validate_snapshot(6, &snapshot);
        assert!(ok, "{msg}");
    }

    #[test]
    fn test_missing_timeline_rejected() {
        let processor = Stage6Processor::new(Stage6Config::default());
        let outcome = processor.validate_input(&json!({"stage": UPSTREAM_TAG}));
        assert!(!outcome.ok);
    }
}
