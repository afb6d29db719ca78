//! Orbit Engine CLI
//!
//! Drives the six-stage pipeline: TLE ingest, SGP4 propagation, coordinate
//! transformation, link analysis, signal analysis, handover events.
//!
//! Usage:
//!   orbit-engine                 full pipeline
//!   orbit-engine --stage 3       one stage, upstream loaded from disk
//!   orbit-engine --stages 2-4    contiguous range
//!   orbit-engine --stages 2,3,4  enumerated range

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use orbit_engine::{build_controller, parse_stage_list};
use pipeline_core::RuntimeContext;

#[derive(Parser, Debug)]
#[command(
    name = "orbit-engine",
    about = "Offline LEO visibility, signal, and handover research pipeline"
)]
struct Args {
    /// Run a single stage (1-6); upstream data is loaded from disk
    #[arg(long, conflicts_with = "stages")]
    stage: Option<u8>,

    /// Run a range of stages: A-B or A,B,C
    #[arg(long)]
    stages: Option<String>,

    /// Run root holding data/, outputs/, cache/, validation_snapshots/
    #[arg(long, default_value = ".")]
    run_root: PathBuf,

    /// Directory with stageN_*.yaml config files
    #[arg(long, default_value = "config")]
    config_dir: PathBuf,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("{}", "=".repeat(60));
    info!("Orbit Engine");
    info!("{}", "=".repeat(60));

    let ctx = RuntimeContext::new(&args.run_root, &args.config_dir);
    let controller = build_controller();

    let outcome = if let Some(stage) = args.stage {
        controller.run_single(&ctx, stage)
    } else if let Some(spec) = &args.stages {
        match parse_stage_list(spec) {
            Ok(stages) => controller.run_range(&ctx, stages),
            Err(message) => {
                error!("{message}");
                std::process::exit(1);
            }
        }
    } else {
        controller.run_all(&ctx)
    };

    if outcome.success {
        info!("pipeline finished: {}", outcome.message);
        Ok(())
    } else {
        error!("pipeline failed: {}", outcome.message);
        std::process::exit(1);
    }
}
