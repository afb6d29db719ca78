//! Runtime context threaded through every stage.
//!
//! The process environment is read exactly once at startup; after that the
//! context is immutable and passed by reference. No module-level singletons.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

/// Sampling behavior for research-scale runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplingMode {
    Auto,
    Enabled,
    Disabled,
}

impl SamplingMode {
    fn parse(raw: &str) -> Self {
        match raw.trim() {
            "1" => Self::Enabled,
            "0" => Self::Disabled,
            _ => Self::Auto,
        }
    }
}

/// Process-wide switches, read once at startup.
#[derive(Debug, Clone)]
pub struct EnvOverrides {
    /// `ORBIT_ENGINE_TEST_MODE`: 50-satellite sampling mode.
    pub test_mode: bool,
    /// `ORBIT_ENGINE_SAMPLING_MODE`: overrides sampling independently.
    pub sampling_mode: SamplingMode,
    /// `ORBIT_ENGINE_MAX_WORKERS`: worker-pool size.
    pub max_workers: usize,
    /// `ORBIT_ENGINE_STAGE3_NO_PREFILTER`: geometric prefilter stays off.
    pub stage3_no_prefilter: bool,
}

pub const DEFAULT_MAX_WORKERS: usize = 30;

impl EnvOverrides {
    pub fn from_env() -> Self {
        let flag = |name: &str| {
            std::env::var(name)
                .map(|v| v.trim() == "1")
                .unwrap_or(false)
        };
        let max_workers = std::env::var("ORBIT_ENGINE_MAX_WORKERS")
            .ok()
            .and_then(|v| v.trim().parse::<usize>().ok())
            .filter(|&n| n > 0)
            .unwrap_or(DEFAULT_MAX_WORKERS);
        let sampling_mode = std::env::var("ORBIT_ENGINE_SAMPLING_MODE")
            .map(|v| SamplingMode::parse(&v))
            .unwrap_or(SamplingMode::Auto);

        Self {
            test_mode: flag("ORBIT_ENGINE_TEST_MODE"),
            sampling_mode,
            max_workers,
            stage3_no_prefilter: std::env::var("ORBIT_ENGINE_STAGE3_NO_PREFILTER")
                .map(|v| v.trim() != "0")
                .unwrap_or(true),
        }
    }

    /// Effective sampling decision: the explicit sampling mode wins,
    /// otherwise test mode decides.
    pub fn sampling_enabled(&self) -> bool {
        match self.sampling_mode {
            SamplingMode::Enabled => true,
            SamplingMode::Disabled => false,
            SamplingMode::Auto => self.test_mode,
        }
    }
}

impl Default for EnvOverrides {
    fn default() -> Self {
        Self {
            test_mode: false,
            sampling_mode: SamplingMode::Auto,
            max_workers: DEFAULT_MAX_WORKERS,
            stage3_no_prefilter: true,
        }
    }
}

/// Immutable per-run context: run root, config directory, environment
/// switches, and the run start instant (used for artifact timestamps).
#[derive(Debug, Clone)]
pub struct RuntimeContext {
    pub run_root: PathBuf,
    pub config_dir: PathBuf,
    pub env: EnvOverrides,
    pub started_at: DateTime<Utc>,
}

impl RuntimeContext {
    pub fn new(run_root: impl Into<PathBuf>, config_dir: impl Into<PathBuf>) -> Self {
        Self {
            run_root: run_root.into(),
            config_dir: config_dir.into(),
            env: EnvOverrides::from_env(),
            started_at: Utc::now(),
        }
    }

    /// Context with default environment, for tests and embedding.
    pub fn with_env(
        run_root: impl Into<PathBuf>,
        config_dir: impl Into<PathBuf>,
        env: EnvOverrides,
    ) -> Self {
        Self {
            run_root: run_root.into(),
            config_dir: config_dir.into(),
            env,
            started_at: Utc::now(),
        }
    }

    pub fn outputs_dir(&self, stage: u8) -> PathBuf {
        self.run_root.join("outputs").join(format!("stage{stage}"))
    }

    pub fn snapshot_dir(&self) -> PathBuf {
        self.run_root.join("validation_snapshots")
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.run_root.join("cache")
    }

    pub fn config_path(&self, file_name: &str) -> PathBuf {
        self.config_dir.join(file_name)
    }

    pub fn run_root(&self) -> &Path {
        &self.run_root
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sampling_mode_precedence() {
        let mut env = EnvOverrides::default();
        assert!(!env.sampling_enabled());

        env.test_mode = true;
        assert!(env.sampling_enabled());

        env.sampling_mode = SamplingMode::Disabled;
        assert!(!env.sampling_enabled());

        env.test_mode = false;
        env.sampling_mode = SamplingMode::Enabled;
        assert!(env.sampling_enabled());
    }

    #[test]
    fn test_stage_paths() {
        let ctx = RuntimeContext::with_env("/tmp/run", "/tmp/cfg", EnvOverrides::default());
        assert_eq!(ctx.outputs_dir(3), PathBuf::from("/tmp/run/outputs/stage3"));
        assert_eq!(
            ctx.snapshot_dir(),
            PathBuf::from("/tmp/run/validation_snapshots")
        );
    }
}
