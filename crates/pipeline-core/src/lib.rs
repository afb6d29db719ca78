//! Pipeline Execution Fabric
//!
//! The orbit engine is a strictly linear DAG of six stages. This crate holds
//! everything the stages share: the controller and its registry, the
//! executor/processor contracts, the two-layer validation framework,
//! artifact and snapshot I/O, per-stage configuration loading, and the
//! worker-pool abstraction used by the compute-heavy stages.
//!
//! Stage payloads are opaque JSON values at this level; each stage crate
//! defines its own typed view of the data it produces and consumes.

pub mod artifacts;
pub mod config;
pub mod context;
pub mod controller;
pub mod error;
pub mod stage;
pub mod validation;
pub mod workers;

pub use context::{EnvOverrides, RuntimeContext, SamplingMode};
pub use controller::{PipelineController, PipelineOutcome};
pub use error::{PipelineError, Result};
pub use stage::{
    StageExecution, StageExecutor, StageMetrics, StageProcessor, StageResult, StageStatus,
    ValidationOutcome,
};
pub use validation::{CheckStatus, ValidationReport, ValidationSnapshot};
pub use workers::{CancellationToken, WorkerPool};

/// NTPU ground station, the fixed observation point for every run.
pub const GROUND_STATION_NAME: &str = "NTPU";
pub const GROUND_STATION_LAT_DEG: f64 = 24.9438889;
pub const GROUND_STATION_LON_DEG: f64 = 121.3708333;
pub const GROUND_STATION_ALT_M: f64 = 36.0;

/// Constellation elevation masks (degrees). Per-constellation, never global.
pub const STARLINK_ELEVATION_THRESHOLD_DEG: f64 = 5.0;
pub const ONEWEB_ELEVATION_THRESHOLD_DEG: f64 = 10.0;

/// Slant-range floor in km. Avoids Doppler extremes on very near passes;
/// there is deliberately no upper bound.
pub const MIN_SLANT_RANGE_KM: f64 = 200.0;

/// A stage fails outright when more than this fraction of its input
/// satellites is dropped.
pub const MAX_DROP_RATE: f64 = 0.05;
