//! Stage 2 processor and executor.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, DurationRound, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use pipeline_core::artifacts;
use pipeline_core::config::load_stage_config;
use pipeline_core::error::{PipelineError, Result};
use pipeline_core::stage::{StageExecutor, StageProcessor, ValidationOutcome};
use pipeline_core::validation::{ValidationReport, ValidationSnapshot};
use pipeline_core::{CancellationToken, RuntimeContext, WorkerPool, MAX_DROP_RATE};

use tle_ingest::{Constellation, TleRecord};

use crate::propagator::Sgp4Propagator;
use crate::time_grid::{TimeGrid, DEFAULT_STEP_SECONDS};
use crate::{
    h5, OrbitalState, SatelliteTrack, EPOCH_STALENESS_DAYS, MAX_POSITION_KM, MAX_VELOCITY_KM_S,
    MIN_POSITION_KM, MIN_VELOCITY_KM_S,
};

pub const STAGE_NUMBER: u8 = 2;
pub const STAGE_NAME: &str = "orbital_propagation";
pub const STAGE_TAG: &str = "stage2_orbital_propagation";
pub const UPSTREAM_TAG: &str = "stage1_orbital_calculation";
pub const OUTPUT_PREFIX: &str = "orbital_propagation_output";
pub const CONFIG_FILE: &str = "stage2_orbital_propagation.yaml";

/// Orbital-period acceptance bands, minutes.
pub const STARLINK_PERIOD_BAND: (f64, f64) = (90.0, 95.0);
pub const ONEWEB_PERIOD_BAND: (f64, f64) = (109.0, 115.0);

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Stage2Config {
    pub time_window: TimeWindowConfig,
    /// Worker count; falls back to the process-wide setting when absent.
    pub max_workers: Option<usize>,
    /// Sampling: auto (follow environment), enabled, or disabled.
    pub mode: SamplingSwitch,
    pub validation: Stage2ValidationConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimeWindowConfig {
    /// Window start; defaults to the newest epoch in the input set,
    /// rounded down to the whole minute.
    pub start: Option<DateTime<Utc>>,
    pub step_seconds: u64,
    pub point_count: usize,
}

impl Default for TimeWindowConfig {
    fn default() -> Self {
        Self {
            start: None,
            step_seconds: DEFAULT_STEP_SECONDS,
            point_count: 240,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SamplingSwitch {
    #[default]
    Auto,
    Enabled,
    Disabled,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Stage2ValidationConfig {
    /// Floor for the per-satellite series length check.
    pub min_points: usize,
}

impl Default for Stage2ValidationConfig {
    fn default() -> Self {
        Self { min_points: 180 }
    }
}

pub struct Stage2Processor {
    config: Stage2Config,
    input_count: usize,
}

impl Stage2Processor {
    pub fn new(config: Stage2Config) -> Self {
        Self {
            config,
            input_count: 0,
        }
    }

    fn parse_records(&self, data: &Value) -> Result<Vec<TleRecord>> {
        let satellites = data
            .get("satellites")
            .cloned()
            .ok_or_else(|| PipelineError::InputSchema("satellites array missing".to_string()))?;
        serde_json::from_value(satellites)
            .map_err(|e| PipelineError::InputSchema(format!("stage 1 satellite record: {e}")))
    }

    fn resolve_grid(&self, records: &[TleRecord]) -> Result<TimeGrid> {
        let start = match self.config.time_window.start {
            Some(start) => start,
            None => {
                let newest = records
                    .iter()
                    .map(|r| r.epoch_datetime)
                    .max()
                    .ok_or_else(|| {
                        PipelineError::InputSchema("no epochs to derive window start".to_string())
                    })?;
                newest
                    .duration_trunc(Duration::minutes(1))
                    .map_err(|e| PipelineError::Config(format!("window start rounding: {e}")))?
            }
        };
        Ok(TimeGrid::new(
            start,
            self.config.time_window.step_seconds,
            self.config.time_window.point_count,
        ))
    }

    fn sampling_enabled(&self, ctx: &RuntimeContext) -> bool {
        match self.config.mode {
            SamplingSwitch::Enabled => true,
            SamplingSwitch::Disabled => false,
            SamplingSwitch::Auto => ctx.env.sampling_enabled(),
        }
    }
}

/// Per-satellite propagation outcome carried back to the coordinator.
struct WorkerOutput {
    record: TleRecord,
    series: std::result::Result<Vec<OrbitalState>, String>,
}

impl StageProcessor for Stage2Processor {
    fn stage_number(&self) -> u8 {
        STAGE_NUMBER
    }

    fn stage_name(&self) -> &'static str {
        STAGE_NAME
    }

    fn validate_input(&self, data: &Value) -> ValidationOutcome {
        if data.get("stage").and_then(Value::as_str) != Some(UPSTREAM_TAG) {
            return ValidationOutcome::fail(format!(
                "upstream payload is not {UPSTREAM_TAG}"
            ));
        }
        match data.get("satellites").and_then(Value::as_array) {
            Some(sats) if !sats.is_empty() => ValidationOutcome::ok(),
            Some(_) => ValidationOutcome::fail("empty satellite input"),
            None => ValidationOutcome::fail("satellites array missing"),
        }
    }

    fn process(&mut self, ctx: &RuntimeContext, data: &Value) -> Result<Value> {
        let mut records = self.parse_records(data)?;
        self.input_count = records.len();

        if self.sampling_enabled(ctx) {
            let limit = 50;
            let mut kept: BTreeMap<&str, usize> = BTreeMap::new();
            records.retain(|r| {
                let count = kept.entry(r.constellation.as_str()).or_insert(0);
                *count += 1;
                *count <= limit
            });
            info!("sampling mode: propagating {} satellites", records.len());
        }

        let grid = self.resolve_grid(&records)?;
        info!(
            "time window {} .. {} ({}s step, {} points)",
            grid.start,
            grid.end(),
            grid.step_seconds,
            grid.len()
        );

        // Epoch staleness screen against the window center.
        let center = grid.center();
        let mut stale: Vec<String> = Vec::new();
        records.retain(|r| {
            let age = (r.epoch_datetime - center).num_days().abs();
            if age > EPOCH_STALENESS_DAYS {
                warn!(
                    "epoch staleness: {} epoch {} is {age} days from window center",
                    r.name, r.epoch_datetime
                );
                stale.push(r.satellite_id.clone());
                false
            } else {
                true
            }
        });
        let propagated_input = records.len();

        let workers = self.config.max_workers.unwrap_or(ctx.env.max_workers);
        let pool = WorkerPool::new(workers)?;
        let cancel = CancellationToken::new();
        info!("propagating {propagated_input} satellites on {} workers", pool.workers());

        let outputs: Vec<WorkerOutput> = pool.map(records, &cancel, |record| {
            let series = Sgp4Propagator::from_tle(&record.tle_line1, &record.tle_line2)
                .and_then(|p| p.propagate_series(&grid))
                .map_err(|e| e.to_string());
            WorkerOutput { record, series }
        });
        WorkerPool::check_cancelled(&cancel, STAGE_NAME)?;

        // Deterministic merge: BTreeMap orders by satellite id.
        let mut tracks: BTreeMap<String, SatelliteTrack> = BTreeMap::new();
        let mut tles: BTreeMap<String, (String, String)> = BTreeMap::new();
        let mut periods: BTreeMap<&'static str, Vec<f64>> = BTreeMap::new();
        let mut failures: Vec<String> = Vec::new();

        for output in outputs {
            match output.series {
                Ok(time_series) => {
                    if let Ok(period) = output.record.orbital_period_minutes() {
                        periods
                            .entry(output.record.constellation.as_str())
                            .or_default()
                            .push(period);
                    }
                    tles.insert(
                        output.record.satellite_id.clone(),
                        (output.record.tle_line1.clone(), output.record.tle_line2.clone()),
                    );
                    tracks.insert(
                        output.record.satellite_id.clone(),
                        SatelliteTrack {
                            constellation: output.record.constellation,
                            time_series,
                        },
                    );
                }
                Err(message) => {
                    warn!("dropping {}: {message}", output.record.name);
                    failures.push(format!("{}: {message}", output.record.satellite_id));
                }
            }
        }

        if propagated_input > 0 {
            let drop_rate = failures.len() as f64 / propagated_input as f64;
            if drop_rate > MAX_DROP_RATE {
                return Err(PipelineError::Validation(format!(
                    "satellite drop rate {:.1}% exceeds {:.0}%",
                    drop_rate * 100.0,
                    MAX_DROP_RATE * 100.0
                )));
            }
        }
        if tracks.is_empty() {
            return Err(PipelineError::Validation(
                "no satellites survived propagation".to_string(),
            ));
        }

        let mean_periods: BTreeMap<&str, f64> = periods
            .iter()
            .map(|(c, values)| (*c, values.iter().sum::<f64>() / values.len() as f64))
            .collect();

        let tle_map: BTreeMap<&String, Vec<&String>> = tles
            .iter()
            .map(|(id, (l1, l2))| (id, vec![l1, l2]))
            .collect();

        Ok(json!({
            "stage": STAGE_TAG,
            "satellites": serde_json::to_value(&tracks)?,
            "metadata": {
                "time_window": {
                    "start": grid.start.to_rfc3339(),
                    "end": grid.end().to_rfc3339(),
                    "step_seconds": grid.step_seconds,
                    "point_count": grid.point_count,
                },
                "constellation_periods_min": mean_periods,
                "worker_count": pool.workers(),
                "input_satellites": self.input_count,
                "stale_epoch_drops": stale,
                "per_satellite_failures": failures,
                "tles": tle_map,
            },
        }))
    }

    fn validate_output(&self, out: &Value) -> ValidationOutcome {
        let Some(satellites) = out.get("satellites").and_then(Value::as_object) else {
            return ValidationOutcome::fail("satellites map missing");
        };
        if satellites.is_empty() {
            return ValidationOutcome::fail("no satellites in output");
        }
        for (id, track) in satellites {
            let points = track
                .get("time_series")
                .and_then(Value::as_array)
                .map(|a| a.len())
                .unwrap_or(0);
            if points == 0 {
                return ValidationOutcome::fail(format!("satellite {id} has no time series"));
            }
        }
        ValidationOutcome::ok()
    }

    fn self_validate(&self, out: &Value) -> ValidationReport {
        let mut report = ValidationReport::new(STAGE_NUMBER, STAGE_NAME);

        let tracks: BTreeMap<String, SatelliteTrack> = out
            .get("satellites")
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default();

        report.record("stage_tag", out.get("stage").and_then(Value::as_str) == Some(STAGE_TAG), "stage tag mismatched");
        report.record("satellite_count", !tracks.is_empty(), "empty output");

        let survival = if self.input_count == 0 {
            1.0
        } else {
            tracks.len() as f64 / self.input_count as f64
        };
        report.record(
            "satellite_count_ratio",
            survival >= 0.95,
            format!("only {:.1}% of stage-1 satellites survived", survival * 100.0),
        );

        let expected_points = self.config.time_window.point_count;
        let min_points = self.config.validation.min_points.min(expected_points);
        let lengths_ok = tracks
            .values()
            .all(|t| t.time_series.len() == expected_points && t.time_series.len() >= min_points);
        report.record(
            "time_series_length",
            lengths_ok,
            format!("series length differs from {expected_points} grid points"),
        );

        let mut positions_ok = true;
        let mut velocities_ok = true;
        let mut finite_ok = true;
        let mut delta_t_ok = true;
        let step_min = self.config.time_window.step_seconds as f64 / 60.0;
        for track in tracks.values() {
            for state in &track.time_series {
                if !state.is_finite() {
                    finite_ok = false;
                }
                let r = state.position_magnitude();
                if !(MIN_POSITION_KM..=MAX_POSITION_KM).contains(&r) {
                    positions_ok = false;
                }
                let v = state.velocity_magnitude();
                if !(MIN_VELOCITY_KM_S..=MAX_VELOCITY_KM_S).contains(&v) {
                    velocities_ok = false;
                }
            }
            for pair in track.time_series.windows(2) {
                let dt = pair[1].minutes_since_epoch - pair[0].minutes_since_epoch;
                if (dt - step_min).abs() > 1e-6 {
                    delta_t_ok = false;
                }
            }
        }
        report.record("position_magnitude", positions_ok, "|position| outside 6500-9000 km");
        report.record("velocity_magnitude", velocities_ok, "|velocity| outside 5-9 km/s");
        report.record("no_nan_values", finite_ok, "non-finite value in time series");
        report.record(
            "epoch_discipline",
            delta_t_ok,
            "minutes_since_epoch spacing inconsistent with the grid step",
        );

        for (constellation, band, check) in [
            (Constellation::Starlink, STARLINK_PERIOD_BAND, "orbital_period_starlink"),
            (Constellation::OneWeb, ONEWEB_PERIOD_BAND, "orbital_period_oneweb"),
        ] {
            let key = constellation.as_str();
            match out
                .pointer(&format!("/metadata/constellation_periods_min/{key}"))
                .and_then(Value::as_f64)
            {
                Some(period) => report.record(
                    check,
                    (band.0..=band.1).contains(&period),
                    format!("{key} mean period {period:.1} min outside {:?}", band),
                ),
                None => report.record_not_applicable(check),
            }
        }

        report
    }

    fn build_snapshot(&self, out: &Value, report: ValidationReport) -> ValidationSnapshot {
        let tracks: BTreeMap<String, SatelliteTrack> = out
            .get("satellites")
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default();

        let mut r_min = f64::INFINITY;
        let mut r_max = f64::NEG_INFINITY;
        let mut per_constellation: BTreeMap<&str, usize> = BTreeMap::new();
        for track in tracks.values() {
            *per_constellation.entry(track.constellation.as_str()).or_insert(0) += 1;
            for state in &track.time_series {
                let r = state.position_magnitude();
                r_min = r_min.min(r);
                r_max = r_max.max(r);
            }
        }

        let time_points = tracks
            .values()
            .next()
            .map(|t| t.time_series.len())
            .unwrap_or(0);

        let sample: Vec<Value> = tracks
            .iter()
            .take(20)
            .map(|(id, track)| {
                json!({
                    "satellite_id": id,
                    "constellation": track.constellation.as_str(),
                    "points": track.time_series.len(),
                    "first_state": track.time_series.first(),
                })
            })
            .collect();

        let data_summary = json!({
            "satellite_count": tracks.len(),
            "time_points": time_points,
            "position_range_km": [r_min, r_max],
            "constellation_periods_min": out.pointer("/metadata/constellation_periods_min"),
            "stale_epoch_drops": out.pointer("/metadata/stale_epoch_drops"),
        });
        let metadata = json!({
            "constellation_summary": per_constellation,
            "standard_references": ["SGP4/SDP4 (Vallado, Revisiting Spacetrack Report #3)"],
            "config": {
                "step_seconds": self.config.time_window.step_seconds,
                "point_count": self.config.time_window.point_count,
                "max_workers": self.config.max_workers,
            },
        });

        report.into_snapshot(data_summary, metadata, sample)
    }
}

pub struct Stage2Executor;

impl StageExecutor for Stage2Executor {
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
        let config: Stage2Config = load_stage_config(ctx, STAGE_NUMBER, CONFIG_FILE)?;
        Ok(Box::new(Stage2Processor::new(config)))
    }

    /// Mirror the JSON artifact as an HDF5 bulk tensor.
    fn persist_extra(&self, ctx: &RuntimeContext, payload: &Value) -> Result<()> {
        let tracks: BTreeMap<String, SatelliteTrack> = payload
            .get("satellites")
            .cloned()
            .map(serde_json::from_value)
            .transpose()?
            .unwrap_or_default();
        if tracks.is_empty() {
            return Ok(());
        }

        let grid = grid_from_metadata(payload)?;
        let json_path = artifacts::latest_artifact(&ctx.outputs_dir(STAGE_NUMBER))?
            .ok_or_else(|| PipelineError::Resource("stage 2 JSON artifact missing".to_string()))?;
        let h5_path = json_path.with_extension("h5");
        h5::write_bulk(&h5_path, &tracks, &grid)?;
        info!("stage 2 bulk tensor written to {}", h5_path.display());
        Ok(())
    }
}

/// Reconstruct the grid a payload was produced on.
pub fn grid_from_metadata(payload: &Value) -> Result<TimeGrid> {
    let start = payload
        .pointer("/metadata/time_window/start")
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc))
        .ok_or_else(|| PipelineError::InputSchema("time_window.start missing".to_string()))?;
    let step_seconds = payload
        .pointer("/metadata/time_window/step_seconds")
        .and_then(Value::as_u64)
        .ok_or_else(|| PipelineError::InputSchema("time_window.step_seconds missing".to_string()))?;
    let point_count = payload
        .pointer("/metadata/time_window/point_count")
        .and_then(Value::as_u64)
        .ok_or_else(|| PipelineError::InputSchema("time_window.point_count missing".to_string()))?;
    Ok(TimeGrid::new(start, step_seconds, point_count as usize))
}
