//! Stage 4 processor and executor.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use pipeline_core::config::load_stage_config;
use pipeline_core::error::{PipelineError, Result};
use pipeline_core::stage::{StageExecutor, StageProcessor, ValidationOutcome};
use pipeline_core::validation::{ValidationReport, ValidationSnapshot};
use pipeline_core::RuntimeContext;

use tle_ingest::Constellation;

use crate::coverage::{self, CoverageStats, GapSeverity};
use crate::set_cover::{optimize_pool, PoolTargets};
use crate::visibility::{self, candidate_from_samples};
use crate::CandidateEntry;

pub const STAGE_NUMBER: u8 = 4;
pub const STAGE_NAME: &str = "link_analysis";
pub const STAGE_TAG: &str = "stage4_link_analysis";
pub const UPSTREAM_TAG: &str = "stage3_coordinate_transformation";
pub const OUTPUT_PREFIX: &str = "stage4_link_analysis";
pub const CONFIG_FILE: &str = "stage4_link_analysis.yaml";

/// Soft acceptance floor for the OneWeb pool.
pub const ONEWEB_SOFT_COVERAGE: f64 = 0.90;

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Stage4Config {
    pub pool_optimization_targets: PoolTargetsConfig,
    pub config_source_priority: SourcePriority,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolTargetsConfig {
    pub starlink: TargetBand,
    pub oneweb: TargetBand,
}

impl Default for PoolTargetsConfig {
    fn default() -> Self {
        Self {
            starlink: TargetBand {
                min_pool_size: 10,
                max_pool_size: 15,
                target_coverage_rate: 0.95,
            },
            oneweb: TargetBand {
                min_pool_size: 3,
                max_pool_size: 6,
                target_coverage_rate: 0.95,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct TargetBand {
    pub min_pool_size: usize,
    pub max_pool_size: usize,
    pub target_coverage_rate: f64,
}

impl TargetBand {
    fn as_targets(&self) -> PoolTargets {
        PoolTargets {
            target_min: self.min_pool_size,
            target_max: self.max_pool_size,
            max_pool_size: self.max_pool_size,
            required_coverage_rate: self.target_coverage_rate,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SourcePriority {
    /// Elevation thresholds stay inherited from the stage-1 configuration;
    /// stage 4 only overrides pool parameters.
    pub auto_merge_stage1: bool,
}

impl Default for SourcePriority {
    fn default() -> Self {
        Self {
            auto_merge_stage1: true,
        }
    }
}

pub struct Stage4Processor {
    config: Stage4Config,
}

impl Stage4Processor {
    pub fn new(config: Stage4Config) -> Self {
        Self { config }
    }

    fn band(&self, constellation: Constellation) -> TargetBand {
        match constellation {
            Constellation::OneWeb => self.config.pool_optimization_targets.oneweb,
            _ => self.config.pool_optimization_targets.starlink,
        }
    }

    fn grid_timestamps(data: &Value) -> Result<(Vec<DateTime<Utc>>, u64)> {
        let grid = orbital_propagation::processor::grid_from_metadata(data)?;
        Ok((grid.timestamps().collect(), grid.step_seconds))
    }
}

fn parse_constellation(raw: &str) -> Constellation {
    match raw {
        "starlink" => Constellation::Starlink,
        "oneweb" => Constellation::OneWeb,
        _ => Constellation::Other,
    }
}

impl StageProcessor for Stage4Processor {
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
        if data.pointer("/metadata/time_window").is_none() {
            return ValidationOutcome::fail("time window metadata missing");
        }
        match data.get("satellites").and_then(Value::as_object) {
            Some(map) if !map.is_empty() => ValidationOutcome::ok(),
            _ => ValidationOutcome::fail("empty satellite map"),
        }
    }

    fn process(&mut self, _ctx: &RuntimeContext, data: &Value) -> Result<Value> {
        let satellites = data
            .get("satellites")
            .and_then(Value::as_object)
            .ok_or_else(|| PipelineError::InputSchema("satellites map missing".to_string()))?;
        let (timestamps, step_seconds) = Self::grid_timestamps(data)?;

        // Candidate pools per constellation; the visibility flag is
        // recomputed from elevation and slant range on the way in.
        let mut pools: BTreeMap<Constellation, Vec<CandidateEntry>> = BTreeMap::from([
            (Constellation::Starlink, Vec::new()),
            (Constellation::OneWeb, Vec::new()),
        ]);
        for (id, entry) in satellites {
            let constellation = entry
                .get("constellation")
                .and_then(Value::as_str)
                .map(parse_constellation)
                .unwrap_or(Constellation::Other);
            if constellation == Constellation::Other {
                warn!("satellite {id} has no constellation tag, skipping");
                continue;
            }
            let samples = visibility::extract_samples(entry, constellation);
            if samples.len() != timestamps.len() {
                return Err(PipelineError::InputSchema(format!(
                    "satellite {id} series length {} does not match grid {}",
                    samples.len(),
                    timestamps.len()
                )));
            }
            if let Some(candidate) =
                candidate_from_samples(id, constellation, samples, step_seconds)
            {
                pools.entry(constellation).or_default().push(candidate);
            }
        }

        let mut connectable = serde_json::Map::new();
        let mut optimized = serde_json::Map::new();
        let mut results = serde_json::Map::new();
        for (constellation, candidates) in &pools {
            let key = constellation.as_str();
            let targets = self.band(*constellation).as_targets();
            info!(
                "{key}: {} candidates, target band [{}, {}]",
                candidates.len(),
                targets.target_min,
                targets.target_max
            );

            let outcome = optimize_pool(candidates, &targets);
            let stats: CoverageStats =
                coverage::analyze(&outcome.visible_counts, &timestamps, &targets, step_seconds);

            let selected_entries: Vec<Value> = outcome
                .selected
                .iter()
                .filter_map(|id| candidates.iter().find(|c| &c.satellite_id == id))
                .map(|c| {
                    json!({
                        "satellite_id": c.satellite_id,
                        "constellation": c.constellation,
                        "service_window": c.service_window,
                    })
                })
                .collect();

            connectable.insert(key.to_string(), serde_json::to_value(candidates)?);
            optimized.insert(key.to_string(), Value::Array(selected_entries));
            results.insert(
                key.to_string(),
                json!({
                    "coverage_rate": stats.coverage_rate,
                    "selected_count": outcome.selected.len(),
                    "candidate_count": candidates.len(),
                    "coverage_gaps": stats.coverage_gaps,
                    "continuous_coverage_hours": stats.continuous_coverage_hours,
                    "visible_counts": outcome.visible_counts,
                }),
            );
        }

        // NTPU aggregate over all candidates, combined and per constellation.
        let all: Vec<&CandidateEntry> = pools.values().flatten().collect();
        let starlink: Vec<&CandidateEntry> = pools[&Constellation::Starlink].iter().collect();
        let oneweb: Vec<&CandidateEntry> = pools[&Constellation::OneWeb].iter().collect();
        let ntpu = json!({
            "combined": coverage::ntpu_analysis(&all, &timestamps, step_seconds),
            "starlink": coverage::ntpu_analysis(&starlink, &timestamps, step_seconds),
            "oneweb": coverage::ntpu_analysis(&oneweb, &timestamps, step_seconds),
        });

        Ok(json!({
            "stage": STAGE_TAG,
            "satellites": satellites.keys().collect::<Vec<_>>(),
            "connectable_satellites": connectable,
            "optimized_pools": optimized,
            "ntpu_analysis": ntpu,
            "optimization_results": results,
            "metadata": {
                "time_window": data.pointer("/metadata/time_window"),
                "ground_station": data.pointer("/metadata/ground_station"),
                "pool_targets": {
                    "starlink": {
                        "min_pool_size": self.config.pool_optimization_targets.starlink.min_pool_size,
                        "max_pool_size": self.config.pool_optimization_targets.starlink.max_pool_size,
                        "target_coverage_rate": self.config.pool_optimization_targets.starlink.target_coverage_rate,
                    },
                    "oneweb": {
                        "min_pool_size": self.config.pool_optimization_targets.oneweb.min_pool_size,
                        "max_pool_size": self.config.pool_optimization_targets.oneweb.max_pool_size,
                        "target_coverage_rate": self.config.pool_optimization_targets.oneweb.target_coverage_rate,
                    },
                },
                "auto_merge_stage1": self.config.config_source_priority.auto_merge_stage1,
            },
        }))
    }

    fn validate_output(&self, out: &Value) -> ValidationOutcome {
        if out.get("connectable_satellites").is_none()
            || out.get("optimized_pools").is_none()
            || out.get("optimization_results").is_none()
        {
            return ValidationOutcome::fail("stage 4 payload sections missing");
        }
        ValidationOutcome::ok()
    }

    fn self_validate(&self, out: &Value) -> ValidationReport {
        let mut report = ValidationReport::new(STAGE_NUMBER, STAGE_NAME);

        report.record(
            "stage_tag",
            out.get("stage").and_then(Value::as_str) == Some(STAGE_TAG),
            "stage tag mismatched",
        );

        let candidates: BTreeMap<String, Vec<CandidateEntry>> = out
            .get("connectable_satellites")
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default();
        let total_candidates: usize = candidates.values().map(Vec::len).sum();
        report.record("candidate_nonempty", total_candidates > 0, "no candidates in any pool");

        // Candidate rule consistency and window sanity.
        let mut rule_ok = true;
        let mut window_ok = true;
        for pool in candidates.values() {
            for candidate in pool {
                let threshold =
                    parse_constellation(&candidate.constellation).elevation_threshold_deg();
                for sample in &candidate.visibility {
                    let expected = visibility::is_connectable(
                        sample.elevation_deg,
                        sample.distance_km,
                        threshold,
                    );
                    if sample.is_connectable != expected {
                        rule_ok = false;
                    }
                }
                let window = &candidate.service_window;
                let score_ok = (0.0..=1.0).contains(&window.continuity_score);
                let order_ok = match (window.first_connectable, window.last_connectable) {
                    (Some(first), Some(last)) => first <= last,
                    _ => false, // candidates always have a connectable sample
                };
                if !score_ok || !order_ok || window.total_connectable_minutes <= 0.0 {
                    window_ok = false;
                }
            }
        }
        report.record(
            "connectable_consistency",
            rule_ok,
            "is_connectable disagrees with threshold and range rule",
        );
        report.record(
            "service_window_consistency",
            window_ok,
            "service window summary inconsistent",
        );

        // Every selected satellite must be a candidate (≥1 connectable t).
        let mut selected_ok = true;
        let mut size_ok = true;
        if let Some(pools) = out.get("optimized_pools").and_then(Value::as_object) {
            for (key, selected) in pools {
                let ids: Vec<String> = selected
                    .as_array()
                    .map(|arr| {
                        arr.iter()
                            .filter_map(|e| e.get("satellite_id"))
                            .filter_map(Value::as_str)
                            .map(String::from)
                            .collect()
                    })
                    .unwrap_or_default();
                let pool_candidates = candidates.get(key).cloned().unwrap_or_default();
                for id in &ids {
                    if !pool_candidates.iter().any(|c| &c.satellite_id == id) {
                        selected_ok = false;
                    }
                }
                let cap = self.band(parse_constellation(key)).max_pool_size;
                if ids.len() > cap {
                    size_ok = false;
                }
            }
        }
        report.record(
            "selected_satellites_connectable",
            selected_ok,
            "selected satellite is not a candidate",
        );
        report.record("pool_size_bounds", size_ok, "selected pool exceeds the hard cap");

        // Coverage acceptance: Starlink hard, OneWeb soft.
        let mut rates_in_range = true;
        let mut critical_gap_count = 0usize;
        for key in ["starlink", "oneweb"] {
            if let Some(rate) = out
                .pointer(&format!("/optimization_results/{key}/coverage_rate"))
                .and_then(Value::as_f64)
            {
                if !(0.0..=1.0).contains(&rate) {
                    rates_in_range = false;
                }
            }
            let gaps: Vec<crate::coverage::CoverageGap> = out
                .pointer(&format!("/optimization_results/{key}/coverage_gaps"))
                .cloned()
                .and_then(|v| serde_json::from_value(v).ok())
                .unwrap_or_default();
            critical_gap_count += gaps
                .iter()
                .filter(|g| g.severity == GapSeverity::Critical)
                .count();
        }
        report.record("coverage_rate_range", rates_in_range, "coverage rate outside [0, 1]");
        report.record(
            "no_critical_gaps",
            critical_gap_count == 0,
            format!("{critical_gap_count} critical coverage gaps"),
        );

        let starlink_rate = out
            .pointer("/optimization_results/starlink/coverage_rate")
            .and_then(Value::as_f64);
        match (candidates.get("starlink").map(Vec::len).unwrap_or(0), starlink_rate) {
            (0, _) => report.record_not_applicable("starlink_coverage_rate"),
            (_, Some(rate)) => report.record(
                "starlink_coverage_rate",
                rate >= self.config.pool_optimization_targets.starlink.target_coverage_rate,
                format!("starlink coverage rate {rate:.3} below target"),
            ),
            (_, None) => report.record("starlink_coverage_rate", false, "rate missing"),
        }

        // Soft floor: a weak OneWeb pool is warned about, never fatal.
        let oneweb_rate = out
            .pointer("/optimization_results/oneweb/coverage_rate")
            .and_then(Value::as_f64);
        match (candidates.get("oneweb").map(Vec::len).unwrap_or(0), oneweb_rate) {
            (0, _) => report.record_not_applicable("oneweb_coverage_rate"),
            (_, Some(rate)) => {
                if rate < ONEWEB_SOFT_COVERAGE {
                    warn!("oneweb coverage rate {rate:.3} below soft floor {ONEWEB_SOFT_COVERAGE}");
                }
                report.record("oneweb_coverage_rate", true, "");
            }
            (_, None) => report.record("oneweb_coverage_rate", false, "rate missing"),
        }

        report
    }

    fn build_snapshot(&self, out: &Value, report: ValidationReport) -> ValidationSnapshot {
        let candidates: BTreeMap<String, Vec<CandidateEntry>> = out
            .get("connectable_satellites")
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default();

        let candidate_counts: BTreeMap<&String, usize> =
            candidates.iter().map(|(k, v)| (k, v.len())).collect();
        let coverage_rates = json!({
            "starlink": out.pointer("/optimization_results/starlink/coverage_rate"),
            "oneweb": out.pointer("/optimization_results/oneweb/coverage_rate"),
        });

        let sample: Vec<Value> = candidates
            .values()
            .flatten()
            .take(20)
            .map(|c| {
                json!({
                    "satellite_id": c.satellite_id,
                    "constellation": c.constellation,
                    "service_window": c.service_window,
                })
            })
            .collect();

        let data_summary = json!({
            "satellite_count": candidates.values().map(Vec::len).sum::<usize>(),
            "candidate_counts": candidate_counts,
            "coverage_rates": coverage_rates,
            "selected_counts": {
                "starlink": out.pointer("/optimization_results/starlink/selected_count"),
                "oneweb": out.pointer("/optimization_results/oneweb/selected_count"),
            },
        });
        let metadata = json!({
            "constellation_summary": candidate_counts,
            "standard_references": ["Chvátal 1979 greedy set cover"],
            "config": {
                "pool_targets": out.pointer("/metadata/pool_targets"),
            },
        });

        report.into_snapshot(data_summary, metadata, sample)
    }
}

pub struct Stage4Executor;

impl StageExecutor for Stage4Executor {
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
        let config: Stage4Config = load_stage_config(ctx, STAGE_NUMBER, CONFIG_FILE)?;
        Ok(Box::new(Stage4Processor::new(config)))
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

    /// Stage-3 style payload with prescribed elevation sequences.
    fn stage3_payload(sats: &[(&str, &str, Vec<f64>)]) -> Value {
        let start = Utc.with_ymd_and_hms(2025, 10, 5, 12, 0, 0).unwrap();
        let points = sats.first().map(|(_, _, e)| e.len()).unwrap_or(0);

        let mut satellites = serde_json::Map::new();
        for (id, constellation, elevations) in sats {
            let threshold = parse_constellation(constellation).elevation_threshold_deg();
            let series: Vec<Value> = elevations
                .iter()
                .enumerate()
                .map(|(i, &elevation)| {
                    json!({
                        "timestamp": (start + Duration::seconds(30 * i as i64)).to_rfc3339(),
                        "position": {"lat": 25.0, "lon": 121.0, "alt_km": 550.0},
                        "ecef": {"x_km": 0.0, "y_km": 0.0, "z_km": 0.0},
                        "visibility_metrics": {
                            "elevation_deg": elevation,
                            "azimuth_deg": 120.0,
                            "distance_km": 900.0,
                            "is_connectable": elevation >= threshold,
                            "threshold_applied": threshold,
                        },
                    })
                })
                .collect();
            satellites.insert(
                id.to_string(),
                json!({"constellation": constellation, "time_series": series}),
            );
        }

        json!({
            "stage": UPSTREAM_TAG,
            "satellites": satellites,
            "metadata": {
                "time_window": {
                    "start": start.to_rfc3339(),
                    "step_seconds": 30,
                    "point_count": points,
                },
            },
        })
    }

    fn small_band(min: usize, max: usize) -> TargetBand {
        TargetBand {
            min_pool_size: min,
            max_pool_size: max,
            target_coverage_rate: 0.95,
        }
    }

    fn config_with_bands(starlink: TargetBand, oneweb: TargetBand) -> Stage4Config {
        Stage4Config {
            pool_optimization_targets: PoolTargetsConfig { starlink, oneweb },
            config_source_priority: SourcePriority::default(),
        }
    }

    #[test]
    fn test_candidates_split_by_constellation() {
        let payload = stage3_payload(&[
            ("44713", "starlink", vec![10.0, 20.0, 30.0, 40.0]),
            ("48000", "oneweb", vec![15.0, 20.0, 15.0, 12.0]),
            ("44999", "starlink", vec![-10.0, -20.0, -30.0, -40.0]),
        ]);
        let tmp = tempfile::tempdir().unwrap();
        let mut processor =
            Stage4Processor::new(config_with_bands(small_band(1, 15), small_band(1, 6)));
        let out = processor.process(&ctx(tmp.path()), &payload).unwrap();

        assert_eq!(out["connectable_satellites"]["starlink"].as_array().unwrap().len(), 1);
        assert_eq!(out["connectable_satellites"]["oneweb"].as_array().unwrap().len(), 1);
        assert_eq!(out["optimized_pools"]["starlink"].as_array().unwrap().len(), 1);
        assert_eq!(out["optimized_pools"]["oneweb"].as_array().unwrap().len(), 1);

        let report = processor.self_validate(&out);
        assert!(report.passed(), "{:?}", report.messages());

        let snapshot = processor.build_snapshot(&out, processor.self_validate(&out));
        let (ok, msg) = pipeline_core::validation::external::validate_snapshot(4, &snapshot);
        assert!(ok, "{msg}");
    }

    #[test]
    fn test_disjoint_coverage_selects_all_three() {
        let high = 30.0;
        let low = -5.0;
        let payload = stage3_payload(&[
            ("1", "starlink", vec![high, high, low, low, low, low]),
            ("2", "starlink", vec![low, low, high, high, low, low]),
            ("3", "starlink", vec![low, low, low, low, high, high]),
        ]);
        let tmp = tempfile::tempdir().unwrap();
        let mut processor = Stage4Processor::new(config_with_bands(
            TargetBand {
                min_pool_size: 1,
                max_pool_size: 15,
                target_coverage_rate: 1.0,
            },
            small_band(1, 6),
        ));
        let out = processor.process(&ctx(tmp.path()), &payload).unwrap();

        let selected = out["optimized_pools"]["starlink"].as_array().unwrap();
        assert_eq!(selected.len(), 3);
        let rate = out["optimization_results"]["starlink"]["coverage_rate"]
            .as_f64()
            .unwrap();
        assert!((rate - 1.0).abs() < 1e-12);
        let gaps = out["optimization_results"]["starlink"]["coverage_gaps"]
            .as_array()
            .unwrap();
        assert!(gaps.is_empty());
    }

    #[test]
    fn test_undersized_pool_flags_starlink_failure() {
        // One candidate against a [10, 15] band: coverage rate 0, hard
        // Starlink check fails in layer 1.
        let payload = stage3_payload(&[("44713", "starlink", vec![30.0, 30.0, 30.0, 30.0])]);
        let tmp = tempfile::tempdir().unwrap();
        let mut processor = Stage4Processor::new(Stage4Config::default());
        let out = processor.process(&ctx(tmp.path()), &payload).unwrap();

        let report = processor.self_validate(&out);
        assert!(!report.passed());
        assert!(report
            .messages()
            .iter()
            .any(|m| m.contains("starlink_coverage_rate")));
    }
}
