//! Stage artifact I/O.
//!
//! Every stage boundary is persisted to disk so any single stage is
//! re-entrant: artifacts carry a `YYYYMMDD_HHMMSS` UTC suffix and the
//! newest-by-filename artifact in a stage directory is the canonical
//! upstream for a single-stage run.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, info};

use crate::context::RuntimeContext;
use crate::error::{PipelineError, Result};

pub const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// `<prefix>_<YYYYMMDD_HHMMSS>.<ext>` for the given instant.
pub fn timestamped_filename(prefix: &str, at: DateTime<Utc>, ext: &str) -> String {
    format!("{prefix}_{}.{ext}", at.format(TIMESTAMP_FORMAT))
}

/// Write a stage's JSON payload to its output directory; returns the path.
pub fn write_stage_output(
    ctx: &RuntimeContext,
    stage: u8,
    prefix: &str,
    payload: &Value,
) -> Result<PathBuf> {
    let dir = ctx.outputs_dir(stage);
    fs::create_dir_all(&dir)?;
    let path = dir.join(timestamped_filename(prefix, Utc::now(), "json"));
    write_json(&path, payload)?;
    info!("stage {stage} output written to {}", path.display());
    Ok(path)
}

pub fn write_json(path: &Path, value: &Value) -> Result<()> {
    let file = File::create(path)?;
    let writer = BufWriter::new(file);
    serde_json::to_writer_pretty(writer, value)?;
    Ok(())
}

pub fn read_json(path: &Path) -> Result<Value> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);
    Ok(serde_json::from_reader(reader)?)
}

/// Newest `*.json` artifact in a stage directory by filename ordering.
/// The timestamp suffix makes lexicographic order chronological.
pub fn latest_artifact(dir: &Path) -> Result<Option<PathBuf>> {
    latest_artifact_with_ext(dir, "json")
}

/// Newest artifact with the given extension (stage 2 also leaves an `h5`
/// bulk tensor beside its JSON artifact).
pub fn latest_artifact_with_ext(dir: &Path, ext: &str) -> Result<Option<PathBuf>> {
    if !dir.is_dir() {
        return Ok(None);
    }
    let mut names: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().map(|e| e == ext).unwrap_or(false))
        .collect();
    names.sort();
    Ok(names.pop())
}

/// Load the newest artifact produced by `stage`, or error when none exists.
pub fn load_latest_stage_output(ctx: &RuntimeContext, stage: u8) -> Result<Value> {
    let dir = ctx.outputs_dir(stage);
    match latest_artifact(&dir)? {
        Some(path) => {
            info!("loading stage {stage} artifact {}", path.display());
            read_json(&path)
        }
        None => Err(PipelineError::InputSchema(format!(
            "no stage {stage} artifact under {}",
            dir.display()
        ))),
    }
}

/// Remove previous outputs for a stage before it re-runs.
pub fn clean_stage_outputs(ctx: &RuntimeContext, stage: u8) -> Result<usize> {
    let dir = ctx.outputs_dir(stage);
    if !dir.is_dir() {
        return Ok(0);
    }
    let mut removed = 0;
    for entry in fs::read_dir(&dir)? {
        let path = entry?.path();
        if path.is_file() {
            fs::remove_file(&path)?;
            removed += 1;
        }
    }
    if removed > 0 {
        debug!("cleaned {removed} old artifacts from {}", dir.display());
    }
    Ok(removed)
}
