//! Stage 1 processor and executor.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use pipeline_core::config::load_stage_config;
use pipeline_core::error::{PipelineError, Result};
use pipeline_core::stage::{StageExecutor, StageProcessor, ValidationOutcome};
use pipeline_core::validation::{ValidationReport, ValidationSnapshot};
use pipeline_core::RuntimeContext;

use crate::catalog::{self, tle_checksum, TLE_LINE_LENGTH};
use crate::{Constellation, TleRecord};

pub const STAGE_NUMBER: u8 = 1;
pub const STAGE_NAME: &str = "tle_loading";
pub const STAGE_TAG: &str = "stage1_orbital_calculation";
pub const OUTPUT_PREFIX: &str = "stage1_output";
pub const CONFIG_FILE: &str = "stage1_tle_loading.yaml";

/// How many satellites per constellation survive in sampling mode.
pub const SAMPLE_SIZE: usize = 50;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Stage1Config {
    pub tle_sources: Vec<TleSource>,
    pub sampling: SamplingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TleSource {
    pub path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    pub sample_size: usize,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            sample_size: SAMPLE_SIZE,
        }
    }
}

impl Default for Stage1Config {
    fn default() -> Self {
        Self {
            tle_sources: vec![
                TleSource {
                    path: PathBuf::from("data/starlink.tle"),
                },
                TleSource {
                    path: PathBuf::from("data/oneweb.tle"),
                },
            ],
            sampling: SamplingConfig::default(),
        }
    }
}

pub struct Stage1Processor {
    config: Stage1Config,
}

impl Stage1Processor {
    pub fn new(config: Stage1Config) -> Self {
        Self { config }
    }

    fn load_catalogs(&self, ctx: &RuntimeContext) -> Result<(Vec<TleRecord>, usize)> {
        let mut records: Vec<TleRecord> = Vec::new();
        let mut dropped = 0;

        for source in &self.config.tle_sources {
            let path = if source.path.is_absolute() {
                source.path.clone()
            } else {
                ctx.run_root.join(&source.path)
            };
            let text = std::fs::read_to_string(&path).map_err(|e| {
                PipelineError::Resource(format!("TLE catalog {}: {e}", path.display()))
            })?;
            let (mut parsed, bad) = catalog::parse_catalog(&text);
            info!(
                "loaded {} element sets from {} ({bad} dropped)",
                parsed.len(),
                path.display()
            );
            dropped += bad;
            records.append(&mut parsed);
        }

        // Untagged satellites carry no threshold or pool target; skip them.
        let before = records.len();
        records.retain(|r| r.constellation != Constellation::Other);
        if records.len() < before {
            warn!("{} satellites without a known constellation tag", before - records.len());
        }

        // Last element set wins on duplicate NORAD ids.
        let mut by_id: BTreeMap<u32, TleRecord> = BTreeMap::new();
        for record in records {
            by_id.insert(record.norad_id, record);
        }
        let mut unique: Vec<TleRecord> = by_id.into_values().collect();

        if ctx.env.sampling_enabled() {
            unique = sample_per_constellation(unique, self.config.sampling.sample_size);
            info!("sampling mode: reduced to {} satellites", unique.len());
        }

        Ok((unique, dropped))
    }

    fn build_payload(&self, records: &[TleRecord], dropped: usize) -> Value {
        let satellites: Vec<Value> = records
            .iter()
            .map(|r| {
                json!({
                    "satellite_id": r.satellite_id,
                    "name": r.name,
                    "norad_id": r.norad_id,
                    "constellation": r.constellation.as_str(),
                    "tle_line1": r.tle_line1,
                    "tle_line2": r.tle_line2,
                    "epoch_datetime": r.epoch_datetime.to_rfc3339(),
                })
            })
            .collect();

        json!({
            "stage": STAGE_TAG,
            "satellites": satellites,
            "metadata": {
                "dropped_records": dropped,
                "constellation_configs": {
                    "starlink": {
                        "elevation_threshold_deg": Constellation::Starlink.elevation_threshold_deg(),
                    },
                    "oneweb": {
                        "elevation_threshold_deg": Constellation::OneWeb.elevation_threshold_deg(),
                    },
                },
                "research_configuration": {
                    "observation_location": {
                        "name": pipeline_core::GROUND_STATION_NAME,
                        "lat": pipeline_core::GROUND_STATION_LAT_DEG,
                        "lon": pipeline_core::GROUND_STATION_LON_DEG,
                        "alt_m": pipeline_core::GROUND_STATION_ALT_M,
                    },
                },
            },
        })
    }
}

fn sample_per_constellation(records: Vec<TleRecord>, limit: usize) -> Vec<TleRecord> {
    let mut kept: BTreeMap<&'static str, usize> = BTreeMap::new();
    records
        .into_iter()
        .filter(|r| {
            let count = kept.entry(r.constellation.as_str()).or_insert(0);
            if *count < limit {
                *count += 1;
                true
            } else {
                false
            }
        })
        .collect()
}

impl StageProcessor for Stage1Processor {
    fn stage_number(&self) -> u8 {
        STAGE_NUMBER
    }

    fn stage_name(&self) -> &'static str {
        STAGE_NAME
    }

    fn validate_input(&self, _data: &Value) -> ValidationOutcome {
        // Stage 1 has no upstream payload.
        ValidationOutcome::ok()
    }

    fn process(&mut self, ctx: &RuntimeContext, _data: &Value) -> Result<Value> {
        let (records, dropped) = self.load_catalogs(ctx)?;
        if records.is_empty() {
            return Err(PipelineError::InputSchema(
                "no valid satellites in any TLE source".to_string(),
            ));
        }
        Ok(self.build_payload(&records, dropped))
    }

    fn validate_output(&self, out: &Value) -> ValidationOutcome {
        if out.get("stage").and_then(Value::as_str) != Some(STAGE_TAG) {
            return ValidationOutcome::fail("stage tag missing or mismatched");
        }
        match out.get("satellites").and_then(Value::as_array) {
            Some(sats) if !sats.is_empty() => ValidationOutcome::ok(),
            _ => ValidationOutcome::fail("empty satellite list"),
        }
    }

    fn self_validate(&self, out: &Value) -> ValidationReport {
        let mut report = ValidationReport::new(STAGE_NUMBER, STAGE_NAME);
        let sats = out
            .get("satellites")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        report.record(
            "stage_tag",
            out.get("stage").and_then(Value::as_str) == Some(STAGE_TAG),
            "payload stage tag mismatched",
        );
        report.record(
            "satellite_count",
            !sats.is_empty(),
            "no satellites in output",
        );

        let mut line_lengths_ok = true;
        let mut checksums_ok = true;
        let mut epochs_ok = true;
        let mut tagged_ok = true;
        let mut fields_ok = true;
        let mut ids = BTreeMap::new();
        for sat in &sats {
            for key in ["satellite_id", "name", "norad_id", "constellation", "tle_line1", "tle_line2", "epoch_datetime"] {
                if sat.get(key).is_none() {
                    fields_ok = false;
                }
            }
            for key in ["tle_line1", "tle_line2"] {
                if let Some(line) = sat.get(key).and_then(Value::as_str) {
                    if line.len() != TLE_LINE_LENGTH {
                        line_lengths_ok = false;
                    }
                    let digit = line.as_bytes().get(68).map(|b| b.wrapping_sub(b'0'));
                    if digit != Some(tle_checksum(line)) {
                        checksums_ok = false;
                    }
                }
            }
            if let Some(epoch) = sat.get("epoch_datetime").and_then(Value::as_str) {
                if chrono::DateTime::parse_from_rfc3339(epoch).is_err() {
                    epochs_ok = false;
                }
            } else {
                epochs_ok = false;
            }
            match sat.get("constellation").and_then(Value::as_str) {
                Some("starlink") | Some("oneweb") => {}
                _ => tagged_ok = false,
            }
            if let Some(id) = sat.get("norad_id").and_then(Value::as_u64) {
                *ids.entry(id).or_insert(0usize) += 1;
            }
        }

        report.record("tle_line_length", line_lengths_ok, "TLE line not 69 characters");
        report.record("tle_checksum", checksums_ok, "TLE checksum mismatch in output");
        report.record("epoch_parse", epochs_ok, "epoch_datetime not ISO-8601");
        report.record("constellation_tagged", tagged_ok, "untagged constellation in output");
        report.record(
            "no_duplicate_norad_ids",
            ids.values().all(|&c| c == 1),
            "duplicate NORAD ids in output",
        );
        report.record("sample_fields_present", fields_ok, "satellite record missing fields");

        report
    }

    fn build_snapshot(&self, out: &Value, report: ValidationReport) -> ValidationSnapshot {
        let sats = out
            .get("satellites")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let mut per_constellation: BTreeMap<String, usize> = BTreeMap::new();
        for sat in &sats {
            if let Some(c) = sat.get("constellation").and_then(Value::as_str) {
                *per_constellation.entry(c.to_string()).or_insert(0) += 1;
            }
        }

        let data_summary = json!({
            "satellite_count": sats.len(),
            "constellations": per_constellation,
            "dropped_records": out.pointer("/metadata/dropped_records"),
        });
        let metadata = json!({
            "constellation_summary": per_constellation,
            "standard_references": ["NORAD TLE format", "CelesTrak catalog layout"],
            "config": {
                "tle_sources": self.config.tle_sources.iter()
                    .map(|s| s.path.display().to_string())
                    .collect::<Vec<_>>(),
                "sample_size": self.config.sampling.sample_size,
            },
        });

        report.into_snapshot(data_summary, metadata, sats)
    }
}

pub struct Stage1Executor;

impl StageExecutor for Stage1Executor {
    fn stage_number(&self) -> u8 {
        STAGE_NUMBER
    }

    fn stage_name(&self) -> &'static str {
        STAGE_NAME
    }

    fn output_prefix(&self) -> &'static str {
        OUTPUT_PREFIX
    }

    fn requires_upstream(&self) -> bool {
        false
    }

    fn create_processor(&self, ctx: &RuntimeContext) -> Result<Box<dyn StageProcessor>> {
        let config: Stage1Config = load_stage_config(ctx, STAGE_NUMBER, CONFIG_FILE)?;
        Ok(Box::new(Stage1Processor::new(config)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synthetic::SyntheticTle;
    use pipeline_core::EnvOverrides;
    use std::io::Write;

    fn write_catalog(dir: &std::path::Path, name: &str, tles: &[SyntheticTle]) -> PathBuf {
        let path = dir.join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        for tle in tles {
            let record = tle.build_record();
            let (l1, l2) = tle.build_lines();
            writeln!(file, "{}\n{}\n{}", record.name, l1, l2).unwrap();
        }
        path
    }

    fn ctx(root: &std::path::Path) -> RuntimeContext {
        RuntimeContext::with_env(root, root.join("config"), EnvOverrides::default())
    }

    #[test]
    fn test_process_builds_stage1_payload() {
        let tmp = tempfile::tempdir().unwrap();
        let starlink = write_catalog(
            tmp.path(),
            "starlink.tle",
            &[SyntheticTle::new(44713, "STARLINK-1007")],
        );
        let oneweb = write_catalog(
            tmp.path(),
            "oneweb.tle",
            &[SyntheticTle::new(48000, "ONEWEB-0001").mean_motion(13.0)],
        );

        let config = Stage1Config {
            tle_sources: vec![TleSource { path: starlink }, TleSource { path: oneweb }],
            sampling: SamplingConfig::default(),
        };
        let mut processor = Stage1Processor::new(config);
        let ctx = ctx(tmp.path());
        let payload = processor.process(&ctx, &Value::Null).unwrap();

        assert_eq!(payload["stage"], STAGE_TAG);
        assert_eq!(payload["satellites"].as_array().unwrap().len(), 2);
        assert_eq!(
            payload.pointer("/metadata/research_configuration/observation_location/name"),
            Some(&json!("NTPU"))
        );

        let report = processor.self_validate(&payload);
        assert!(report.passed(), "{:?}", report.messages());

        let snapshot = processor.build_snapshot(&payload, report);
        let (ok, msg) = pipeline_core::validation::external::validate_snapshot(1, &snapshot);
        assert!(ok, "{msg}");
    }

    #[test]
    fn test_missing_catalog_is_resource_error() {
        let tmp = tempfile::tempdir().unwrap();
        let config = Stage1Config {
            tle_sources: vec![TleSource {
                path: tmp.path().join("absent.tle"),
            }],
            sampling: SamplingConfig::default(),
        };
        let mut processor = Stage1Processor::new(config);
        let err = processor.process(&ctx(tmp.path()), &Value::Null).unwrap_err();
        assert!(matches!(err, PipelineError::Resource(_)));
    }

    #[test]
    fn test_sampling_caps_each_constellation() {
        let records: Vec<TleRecord> = (0..120)
            .map(|i| SyntheticTle::new(50000 + i, &format!("STARLINK-{i}")).build_record())
            .chain((0..10).map(|i| {
                SyntheticTle::new(60000 + i, &format!("ONEWEB-{i:04}"))
                    .mean_motion(13.0)
                    .build_record()
            }))
            .collect();

        let sampled = sample_per_constellation(records, 50);
        let starlink = sampled
            .iter()
            .filter(|r| r.constellation == Constellation::Starlink)
            .count();
        assert_eq!(starlink, 50);
        assert_eq!(sampled.len(), 60);
    }
}
