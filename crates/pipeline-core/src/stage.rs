//! Stage contracts: the processor interface every stage implements and the
//! executor template that drives one stage end to end.
//!
//! The execution flow is fixed. Stages supply `create_processor` (which
//! loads their config) and identity metadata only; the provided `execute`
//! body is the single code path for every stage and is not meant to be
//! overridden.

use std::path::PathBuf;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info};

use crate::artifacts;
use crate::context::RuntimeContext;
use crate::error::Result;
use crate::validation::{self, ValidationReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Success,
    Failed,
    Partial,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageMetrics {
    pub duration_seconds: f64,
    pub peak_memory_mb: Option<f64>,
    pub satellites_in: usize,
    pub satellites_out: usize,
}

impl StageMetrics {
    pub fn empty() -> Self {
        Self {
            duration_seconds: 0.0,
            peak_memory_mb: None,
            satellites_in: 0,
            satellites_out: 0,
        }
    }
}

/// Result of one stage run. `status == Success` guarantees no fatal error
/// occurred; the payload is the input to stage N+1.
#[derive(Debug, Clone)]
pub struct StageResult {
    pub status: StageStatus,
    pub payload: Value,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub metrics: StageMetrics,
}

impl StageResult {
    pub fn failed(errors: Vec<String>, warnings: Vec<String>) -> Self {
        Self {
            status: StageStatus::Failed,
            payload: Value::Null,
            errors,
            warnings,
            metrics: StageMetrics::empty(),
        }
    }
}

/// Outcome of input/output validation inside a processor.
#[derive(Debug, Clone, Default)]
pub struct ValidationOutcome {
    pub ok: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationOutcome {
    pub fn ok() -> Self {
        Self {
            ok: true,
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            errors: vec![message.into()],
            warnings: Vec::new(),
        }
    }

    pub fn warn(mut self, message: impl Into<String>) -> Self {
        self.warnings.push(message.into());
        self
    }
}

/// Contract shared by all six stages. `process` performs no file writes;
/// writing the validation snapshot is the only permitted side effect in
/// the template flow.
pub trait StageProcessor {
    fn stage_number(&self) -> u8;
    fn stage_name(&self) -> &'static str;

    fn validate_input(&self, data: &Value) -> ValidationOutcome;
    fn process(&mut self, ctx: &RuntimeContext, data: &Value) -> Result<Value>;
    fn validate_output(&self, out: &Value) -> ValidationOutcome;

    /// Layer-1 domain checks over the produced payload.
    fn self_validate(&self, out: &Value) -> ValidationReport;

    /// Snapshot assembly around a Layer-1 report: summary statistics,
    /// algorithm/standard metadata, and an audit sample of records.
    fn build_snapshot(
        &self,
        out: &Value,
        report: ValidationReport,
    ) -> validation::ValidationSnapshot;

    /// Run Layer 1 and persist the snapshot. Returns whether Layer 1 passed.
    fn save_validation_snapshot(&self, ctx: &RuntimeContext, out: &Value) -> Result<bool> {
        let report = self.self_validate(out);
        let passed = report.passed();
        let failure = report.first_failure().map(|s| s.to_string());
        let snapshot = self.build_snapshot(out, report);
        validation::write_snapshot(ctx, &snapshot)?;
        if let Some(msg) = failure {
            error!("stage {} layer-1 validation failed: {msg}", self.stage_number());
        }
        Ok(passed)
    }
}

/// One executed stage: the result, the processor that produced it (kept
/// alive so the controller can run Layer-1 validation), and the artifact
/// path when one was written.
pub struct StageExecution {
    pub result: StageResult,
    pub processor: Box<dyn StageProcessor>,
    pub artifact: Option<PathBuf>,
}

/// Per-stage executor. Implementations provide identity and processor
/// construction; the execution template is inherited, not overridden.
pub trait StageExecutor: Send + Sync {
    fn stage_number(&self) -> u8;
    fn stage_name(&self) -> &'static str;

    /// Filename prefix for this stage's JSON artifact.
    fn output_prefix(&self) -> &'static str;

    /// False only for stage 1.
    fn requires_upstream(&self) -> bool {
        self.stage_number() > 1
    }

    /// Load config and build the processor.
    fn create_processor(&self, ctx: &RuntimeContext) -> Result<Box<dyn StageProcessor>>;

    /// Extra persistence hook (stage 2 writes an HDF5 tensor here).
    fn persist_extra(&self, _ctx: &RuntimeContext, _payload: &Value) -> Result<()> {
        Ok(())
    }

    /// Fixed execution flow: banner, clean old outputs, resolve upstream
    /// (in-memory result or newest on-disk artifact), construct processor,
    /// validate input, process, validate output, persist.
    fn execute(&self, ctx: &RuntimeContext, upstream: Option<Value>) -> Result<StageExecution> {
        let stage = self.stage_number();
        info!("{}", "=".repeat(60));
        info!("Stage {stage}: {}", self.stage_name());
        info!("{}", "=".repeat(60));

        artifacts::clean_stage_outputs(ctx, stage)?;

        let input = if self.requires_upstream() {
            match upstream {
                Some(value) => value,
                None => artifacts::load_latest_stage_output(ctx, stage - 1)?,
            }
        } else {
            upstream.unwrap_or(Value::Null)
        };

        let mut processor = self.create_processor(ctx)?;

        let started = Instant::now();
        let input_check = processor.validate_input(&input);
        if !input_check.ok {
            return Ok(StageExecution {
                result: StageResult::failed(input_check.errors, input_check.warnings),
                processor,
                artifact: None,
            });
        }

        let payload = match processor.process(ctx, &input) {
            Ok(payload) => payload,
            Err(err) => {
                error!("stage {stage} processing failed: {err}");
                return Ok(StageExecution {
                    result: StageResult::failed(
                        vec![format!("{}: {err}", err.kind())],
                        input_check.warnings,
                    ),
                    processor,
                    artifact: None,
                });
            }
        };

        let output_check = processor.validate_output(&payload);
        if !output_check.ok {
            return Ok(StageExecution {
                result: StageResult::failed(output_check.errors, output_check.warnings),
                processor,
                artifact: None,
            });
        }

        let metrics = StageMetrics {
            duration_seconds: started.elapsed().as_secs_f64(),
            peak_memory_mb: peak_memory_mb(),
            satellites_in: count_satellites(&input),
            satellites_out: count_satellites(&payload),
        };

        let artifact = artifacts::write_stage_output(ctx, stage, self.output_prefix(), &payload)?;
        self.persist_extra(ctx, &payload)?;

        let mut warnings = input_check.warnings;
        warnings.extend(output_check.warnings);

        info!(
            "stage {stage} complete in {:.2}s ({} satellites)",
            metrics.duration_seconds, metrics.satellites_out
        );

        Ok(StageExecution {
            result: StageResult {
                status: StageStatus::Success,
                payload,
                errors: Vec::new(),
                warnings,
                metrics,
            },
            processor,
            artifact: Some(artifact),
        })
    }
}

/// Count satellites in a payload, looking at the conventional keys. Used
/// for metrics only; stages make their own schema checks.
pub fn count_satellites(payload: &Value) -> usize {
    if let Some(sats) = payload.get("satellites") {
        if let Some(arr) = sats.as_array() {
            return arr.len();
        }
        if let Some(map) = sats.as_object() {
            return map.len();
        }
    }
    0
}

/// Peak RSS from /proc/self/status, when the platform provides it.
fn peak_memory_mb() -> Option<f64> {
    let text = std::fs::read_to_string("/proc/self/status").ok()?;
    let line = text.lines().find(|l| l.starts_with("VmHWM:"))?;
    let kb: f64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kb / 1024.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_count_satellites_map_and_array() {
        assert_eq!(count_satellites(&json!({"satellites": [1, 2, 3]})), 3);
        assert_eq!(count_satellites(&json!({"satellites": {"a": 1, "b": 2}})), 2);
        assert_eq!(count_satellites(&json!({"other": 1})), 0);
    }

    #[test]
    fn test_validation_outcome_builders() {
        let ok = ValidationOutcome::ok().warn("minor");
        assert!(ok.ok);
        assert_eq!(ok.warnings.len(), 1);

        let fail = ValidationOutcome::fail("missing stage tag");
        assert!(!fail.ok);
        assert_eq!(fail.errors.len(), 1);
    }
}
