//! Pipeline controller.
//!
//! Drives the stage registry in one of three modes: full pipeline, single
//! stage (upstream read from disk), or an ordered range. Data flows
//! in-memory between consecutive stages; at every stage boundary the
//! artifact is also on disk, which is what makes single-stage runs
//! re-entrant. Any failure halts the pipeline immediately.

use std::collections::BTreeMap;
use std::time::Instant;

use serde_json::Value;
use tracing::{error, info};

use crate::context::RuntimeContext;
use crate::error::Result;
use crate::stage::{StageExecutor, StageStatus};
use crate::validation::{self, external};

pub struct PipelineController {
    executors: BTreeMap<u8, Box<dyn StageExecutor>>,
}

/// What a run returns: overall verdict, the last stage that ran, a
/// one-line message, and per-stage durations for the success summary.
#[derive(Debug)]
pub struct PipelineOutcome {
    pub success: bool,
    pub last_stage: u8,
    pub message: String,
    pub stage_durations: Vec<(u8, f64)>,
}

impl PipelineController {
    pub fn new() -> Self {
        Self {
            executors: BTreeMap::new(),
        }
    }

    pub fn register(&mut self, executor: Box<dyn StageExecutor>) {
        self.executors.insert(executor.stage_number(), executor);
    }

    pub fn registered_stages(&self) -> Vec<u8> {
        self.executors.keys().copied().collect()
    }

    /// Full pipeline over every registered stage, in order.
    pub fn run_all(&self, ctx: &RuntimeContext) -> PipelineOutcome {
        self.run_stages(ctx, self.registered_stages(), false)
    }

    /// One stage in isolation; upstream is forced to load from disk.
    pub fn run_single(&self, ctx: &RuntimeContext, stage: u8) -> PipelineOutcome {
        self.run_stages(ctx, vec![stage], true)
    }

    /// Ordered list of stages. The first loads its input from disk;
    /// each later stage receives its predecessor's in-memory result when
    /// the predecessor was part of this run.
    pub fn run_range(&self, ctx: &RuntimeContext, stages: Vec<u8>) -> PipelineOutcome {
        if stages.is_empty() {
            return PipelineOutcome {
                success: false,
                last_stage: 0,
                message: "empty stage list".to_string(),
                stage_durations: Vec::new(),
            };
        }
        self.run_stages(ctx, stages, true)
    }

    fn run_stages(
        &self,
        ctx: &RuntimeContext,
        stages: Vec<u8>,
        first_from_disk: bool,
    ) -> PipelineOutcome {
        let total = Instant::now();
        let mut results: BTreeMap<u8, Value> = BTreeMap::new();
        let mut durations: Vec<(u8, f64)> = Vec::new();

        for (index, &stage) in stages.iter().enumerate() {
            let Some(executor) = self.executors.get(&stage) else {
                return fail(stage, "unknown stage", format!("stage {stage} is not registered"), durations);
            };

            // In-memory predecessor result, unless this is the entry stage
            // of a disk-first run.
            let upstream = if index == 0 && first_from_disk {
                None
            } else {
                results.get(&(stage - 1)).cloned()
            };

            let execution = match executor.execute(ctx, upstream) {
                Ok(execution) => execution,
                Err(err) => {
                    return fail(stage, err.kind(), err.to_string(), durations);
                }
            };

            if execution.result.status != StageStatus::Success {
                let detail = execution
                    .result
                    .errors
                    .first()
                    .cloned()
                    .unwrap_or_else(|| "stage reported failure".to_string());
                return fail(stage, "stage failure", detail, durations);
            }

            // Layer 1: processor self-validation, snapshot written to disk.
            let layer1 = match execution
                .processor
                .save_validation_snapshot(ctx, &execution.result.payload)
            {
                Ok(passed) => passed,
                Err(err) => return fail(stage, err.kind(), err.to_string(), durations),
            };
            if !layer1 {
                return fail(
                    stage,
                    "ValidationError",
                    "layer-1 self-validation failed (see snapshot)".to_string(),
                    durations,
                );
            }

            // Layer 2: external check against the on-disk snapshot.
            let verdict = self.validate_external(ctx, stage);
            match verdict {
                Ok((true, msg)) => info!("layer-2 validation: {msg}"),
                Ok((false, msg)) => return fail(stage, "ValidationError", msg, durations),
                Err(err) => return fail(stage, err.kind(), err.to_string(), durations),
            }

            durations.push((stage, execution.result.metrics.duration_seconds));
            results.insert(stage, execution.result.payload);
        }

        let elapsed = total.elapsed().as_secs_f64();
        info!("{}", "=".repeat(60));
        info!("PIPELINE COMPLETE");
        for (stage, secs) in &durations {
            info!("  stage {stage}: {secs:.2}s");
        }
        info!("  total: {elapsed:.2}s");

        PipelineOutcome {
            success: true,
            last_stage: *stages.last().unwrap_or(&0),
            message: format!("{} stages in {elapsed:.2}s", durations.len()),
            stage_durations: durations,
        }
    }

    fn validate_external(&self, ctx: &RuntimeContext, stage: u8) -> Result<(bool, String)> {
        let snapshot = validation::read_snapshot(ctx, stage)?;
        Ok(external::validate_snapshot(stage, &snapshot))
    }
}

impl Default for PipelineController {
    fn default() -> Self {
        Self::new()
    }
}

fn fail(
    stage: u8,
    kind: &str,
    detail: String,
    durations: Vec<(u8, f64)>,
) -> PipelineOutcome {
    error!("stage {stage} failed [{kind}]: {detail}");
    PipelineOutcome {
        success: false,
        last_stage: stage,
        message: format!("stage {stage} [{kind}]: {detail}"),
        stage_durations: durations,
    }
}
