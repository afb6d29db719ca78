//! Stage 5 processor and executor.

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

use link_analysis::CandidateEntry;

use crate::link_budget::{LinkBudget, LinkBudgetParams};
use crate::{SignalSample, RSRP_MAX_DBM, RSRP_MIN_DBM, SINR_MAX_DB, SINR_MIN_DB};

pub const STAGE_NUMBER: u8 = 5;
pub const STAGE_NAME: &str = "signal_analysis";
pub const STAGE_TAG: &str = "stage5_signal_analysis";
pub const UPSTREAM_TAG: &str = "stage4_link_analysis";
pub const OUTPUT_PREFIX: &str = "stage5_signal_analysis";
pub const CONFIG_FILE: &str = "stage5_signal_analysis.yaml";

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Stage5Config {
    pub link_budget: LinkBudgetParams,
}

pub struct Stage5Processor {
    config: Stage5Config,
    input_pool_size: usize,
}

impl Stage5Processor {
    pub fn new(config: Stage5Config) -> Self {
        Self {
            config,
            input_pool_size: 0,
        }
    }

    /// Optimized-pool candidates with their full visibility series, keyed
    /// by satellite id.
    fn pool_candidates(data: &Value) -> Result<BTreeMap<String, CandidateEntry>> {
        let candidates: BTreeMap<String, Vec<CandidateEntry>> = data
            .get("connectable_satellites")
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| PipelineError::InputSchema(format!("connectable_satellites: {e}")))?
            .unwrap_or_default();

        let mut selected = BTreeMap::new();
        if let Some(pools) = data.get("optimized_pools").and_then(Value::as_object) {
            for (constellation, pool) in pools {
                let ids: Vec<&str> = pool
                    .as_array()
                    .map(|arr| {
                        arr.iter()
                            .filter_map(|e| e.get("satellite_id"))
                            .filter_map(Value::as_str)
                            .collect()
                    })
                    .unwrap_or_default();
                let lookup = candidates.get(constellation);
                for id in ids {
                    let candidate = lookup
                        .and_then(|pool| pool.iter().find(|c| c.satellite_id == id))
                        .ok_or_else(|| {
                            PipelineError::InputSchema(format!(
                                "selected satellite {id} has no visibility series"
                            ))
                        })?;
                    selected.insert(id.to_string(), candidate.clone());
                }
            }
        }
        Ok(selected)
    }
}

impl StageProcessor for Stage5Processor {
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
        if data.get("optimized_pools").and_then(Value::as_object).is_none() {
            return ValidationOutcome::fail("optimized_pools missing");
        }
        ValidationOutcome::ok()
    }

    fn process(&mut self, _ctx: &RuntimeContext, data: &Value) -> Result<Value> {
        let pool = Self::pool_candidates(data)?;
        if pool.is_empty() {
            return Err(PipelineError::InputSchema(
                "optimized pools are empty".to_string(),
            ));
        }
        self.input_pool_size = pool.len();

        let budget = LinkBudget::new(self.config.link_budget.clone());
        info!("signal analysis over {} pool satellites", pool.len());

        // Per-satellite signal series at connectable samples only.
        let mut satellites = serde_json::Map::new();
        let mut best_per_timestamp: BTreeMap<DateTime<Utc>, (String, f64)> = BTreeMap::new();
        let mut all_timestamps: BTreeMap<DateTime<Utc>, ()> = BTreeMap::new();

        for (id, candidate) in &pool {
            let mut series: Vec<SignalSample> = Vec::new();
            for sample in &candidate.visibility {
                all_timestamps.insert(sample.timestamp, ());
                if !sample.is_connectable {
                    continue;
                }
                let measured =
                    budget.measure(sample.timestamp, sample.elevation_deg, sample.distance_km);
                match best_per_timestamp.get(&sample.timestamp) {
                    Some((_, best)) if *best >= measured.rsrp_dbm => {}
                    _ => {
                        best_per_timestamp
                            .insert(sample.timestamp, (id.clone(), measured.rsrp_dbm));
                    }
                }
                series.push(measured);
            }
            satellites.insert(
                id.clone(),
                json!({
                    "constellation": candidate.constellation,
                    "signal_series": series,
                }),
            );
        }

        // Serving timeline: strongest RSRP per timestamp, null when no
        // pool satellite is connectable.
        let serving_timeline: Vec<Value> = all_timestamps
            .keys()
            .map(|timestamp| {
                let serving = best_per_timestamp.get(timestamp);
                json!({
                    "timestamp": timestamp.to_rfc3339(),
                    "serving": serving.map(|(id, _)| id.clone()),
                    "serving_rsrp_dbm": serving.map(|(_, rsrp)| *rsrp),
                })
            })
            .collect();

        // Per-constellation RSRP summary.
        let mut by_constellation: BTreeMap<String, Vec<f64>> = BTreeMap::new();
        for (id, entry) in &satellites {
            let series: Vec<SignalSample> =
                serde_json::from_value(entry["signal_series"].clone())?;
            let constellation = pool[id].constellation.clone();
            by_constellation
                .entry(constellation)
                .or_default()
                .extend(series.iter().map(|s| s.rsrp_dbm));
        }
        let summary: BTreeMap<String, Value> = by_constellation
            .iter()
            .map(|(constellation, rsrps)| {
                let mean = rsrps.iter().sum::<f64>() / rsrps.len().max(1) as f64;
                let min = rsrps.iter().copied().fold(f64::INFINITY, f64::min);
                let max = rsrps.iter().copied().fold(f64::NEG_INFINITY, f64::max);
                (
                    constellation.clone(),
                    json!({
                        "samples": rsrps.len(),
                        "mean_rsrp_dbm": mean,
                        "min_rsrp_dbm": min,
                        "max_rsrp_dbm": max,
                    }),
                )
            })
            .collect();

        Ok(json!({
            "stage": STAGE_TAG,
            "satellites": satellites,
            "serving_timeline": serving_timeline,
            "summary": summary,
            "metadata": {
                "time_window": data.pointer("/metadata/time_window"),
                "link_budget": {
                    "frequency_ghz": self.config.link_budget.frequency_ghz,
                    "eirp_per_rb_dbm": self.config.link_budget.eirp_per_rb_dbm,
                    "rx_gain_db": self.config.link_budget.rx_gain_db,
                    "zenith_attenuation_db": self.config.link_budget.zenith_attenuation_db,
                    "interference_floor_dbm": self.config.link_budget.interference_floor_dbm,
                },
                "models": ["free-space path loss", "Kasten-Young air mass"],
            },
        }))
    }

    fn validate_output(&self, out: &Value) -> ValidationOutcome {
        match out.get("satellites").and_then(Value::as_object) {
            Some(map) if !map.is_empty() => ValidationOutcome::ok(),
            _ => ValidationOutcome::fail("no satellites in signal output"),
        }
    }

    fn self_validate(&self, out: &Value) -> ValidationReport {
        let mut report = ValidationReport::new(STAGE_NUMBER, STAGE_NAME);
        let satellites = out
            .get("satellites")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();

        report.record("stage_tag", out.get("stage").and_then(Value::as_str) == Some(STAGE_TAG), "stage tag mismatched");
        report.record("satellite_count", !satellites.is_empty(), "no pool satellites analyzed");
        report.record(
            "satellite_count_ratio",
            satellites.len() == self.input_pool_size || self.input_pool_size == 0,
            "pool satellites lost during signal analysis",
        );

        let mut rsrp_ok = true;
        let mut sinr_ok = true;
        let mut finite_ok = true;
        let mut monotonic_ok = true;
        for entry in satellites.values() {
            let series: Vec<SignalSample> = entry
                .get("signal_series")
                .cloned()
                .and_then(|v| serde_json::from_value(v).ok())
                .unwrap_or_default();
            for sample in &series {
                if !sample.is_finite() {
                    finite_ok = false;
                }
                if !(RSRP_MIN_DBM..=RSRP_MAX_DBM).contains(&sample.rsrp_dbm) {
                    rsrp_ok = false;
                }
                if !(SINR_MIN_DB..=SINR_MAX_DB).contains(&sample.sinr_db) {
                    sinr_ok = false;
                }
            }
            // Path loss must grow with slant range.
            for a in series.iter() {
                for b in series.iter() {
                    if a.distance_km + 1.0 < b.distance_km && a.fspl_db >= b.fspl_db {
                        monotonic_ok = false;
                    }
                }
            }
        }
        report.record("rsrp_range", rsrp_ok, "RSRP outside 3GPP reporting range");
        report.record("sinr_range", sinr_ok, "SINR outside sanity band");
        report.record("no_nan_values", finite_ok, "non-finite signal value");
        report.record("path_loss_monotonic", monotonic_ok, "FSPL not monotonic in range");

        // A serving satellite must exist whenever any pool satellite has a
        // measurement at that timestamp.
        let mut serving_ok = true;
        if let Some(timeline) = out.get("serving_timeline").and_then(Value::as_array) {
            let mut measured: BTreeMap<&str, ()> = BTreeMap::new();
            for entry in satellites.values() {
                if let Some(series) = entry.get("signal_series").and_then(Value::as_array) {
                    for sample in series {
                        if let Some(ts) = sample.get("timestamp").and_then(Value::as_str) {
                            measured.insert(ts, ());
                        }
                    }
                }
            }
            for slot in timeline {
                let ts = slot.get("timestamp").and_then(Value::as_str).unwrap_or("");
                let has_serving = slot.get("serving").map(|s| !s.is_null()).unwrap_or(false);
                if measured.contains_key(ts) && !has_serving {
                    serving_ok = false;
                }
            }
        } else {
            serving_ok = false;
        }
        report.record(
            "serving_continuity",
            serving_ok,
            "timestamp with measurements but no serving satellite",
        );

        report
    }

    fn build_snapshot(&self, out: &Value, report: ValidationReport) -> ValidationSnapshot {
        let satellites = out
            .get("satellites")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();

        let mut rsrp_min = f64::INFINITY;
        let mut rsrp_max = f64::NEG_INFINITY;
        let mut sample_records = Vec::new();
        for (id, entry) in satellites.iter().take(20) {
            let series: Vec<SignalSample> = entry
                .get("signal_series")
                .cloned()
                .and_then(|v| serde_json::from_value(v).ok())
                .unwrap_or_default();
            for s in &series {
                rsrp_min = rsrp_min.min(s.rsrp_dbm);
                rsrp_max = rsrp_max.max(s.rsrp_dbm);
            }
            sample_records.push(json!({
                "satellite_id": id,
                "constellation": entry.get("constellation"),
                "samples": series.len(),
                "first_sample": series.first(),
            }));
        }

        let data_summary = json!({
            "satellite_count": satellites.len(),
            "rsrp_range_dbm": [rsrp_min, rsrp_max],
            "summary": out.get("summary"),
        });
        let metadata = json!({
            "constellation_summary": out.get("summary"),
            "standard_references": [
                "3GPP TS 38.215 measurement definitions",
                "ITU-R P.676 (simplified zenith attenuation)",
            ],
            "config": out.pointer("/metadata/link_budget"),
        });

        report.into_snapshot(data_summary, metadata, sample_records)
    }
}

pub struct Stage5Executor;

impl StageExecutor for Stage5Executor {
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
        let config: Stage5Config = load_stage_config(ctx, STAGE_NUMBER, CONFIG_FILE)?;
        Ok(Box::new(Stage5Processor::new(config)))
    }
}
