//! Pipeline error taxonomy.
//!
//! Everything here is fatal and fail-fast except per-satellite failures,
//! which never cross a stage boundary: stages log them, count them, and
//! drop the satellite, failing only when the drop rate exceeds 5%.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("input schema error: {0}")]
    InputSchema(String),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("resource error: {0}")]
    Resource(String),
    #[error("stage cancelled: {0}")]
    Cancelled(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, PipelineError>;

impl PipelineError {
    /// Short kind tag used in controller diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "ConfigError",
            Self::InputSchema(_) => "InputSchemaError",
            Self::Validation(_) => "ValidationError",
            Self::Resource(_) => "ResourceError",
            Self::Cancelled(_) => "CancellationError",
            Self::Io(_) | Self::Json(_) => "ResourceError",
        }
    }
}
