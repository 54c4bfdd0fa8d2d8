//! organseg - command line entry point
//!
//! Reads an image, runs every sub-model of the chosen task from the local
//! model cache and writes the fused label map.

use clap::Parser;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

use organseg::core::config::PipelineConfig;
use organseg::core::error::{Result, SegError};
use organseg::core::types::{SpeedMode, TaskName};
use organseg::hub::CacheHub;
use organseg::io::{self, SUPPORTED_EXTENSIONS};
use organseg::runner::{DeviceAssignment, VoxelLinearBackend};
use organseg::task::Orchestrator;

/// Multi-organ segmentation of CT and MR volumes
#[derive(Parser, Debug)]
#[command(name = "organseg")]
#[command(version, about = "Multi-organ segmentation of CT and MR volumes")]
#[command(after_help = "The bundled backend runs voxel-linear JSON weights only. \
Trained checkpoints from the model cache need a network runtime plugged in through the library's Backend trait.")]
struct Args {
    /// Input image path
    #[arg(short, long, value_name = "FILEPATH")]
    input: PathBuf,

    /// Output segmentation path
    #[arg(short, long, value_name = "FILEPATH", default_value = "Seg.nii.gz")]
    output: PathBuf,

    /// Which task to run; determines what is predicted (total, total_mr)
    #[arg(long, default_value = "total")]
    task: TaskName,

    /// Run the faster lower resolution model (3mm)
    #[arg(short, long)]
    fast: bool,

    /// GPU list (e.g. '0' or '0,1'); defaults to CUDA_VISIBLE_DEVICES, empty for CPU
    #[arg(short, long)]
    gpu: Option<String>,

    /// Number of CPU workers when no GPU is given [default: cpu_workers of the config, 1]
    #[arg(long)]
    cpu: Option<usize>,

    /// Suppress console output
    #[arg(short, long)]
    quiet: bool,

    /// Pipeline configuration file (TOML)
    #[arg(long, value_name = "FILEPATH")]
    config: Option<PathBuf>,
}

/// Accept the historical single-dash spellings `-ta` and `-quiet`
fn normalize_args(args: impl IntoIterator<Item = String>) -> Vec<String> {
    args.into_iter()
        .map(|arg| {
            if arg == "-ta" {
                "--task".to_string()
            } else if arg == "-quiet" {
                "--quiet".to_string()
            } else if let Some(task) = arg.strip_prefix("-ta=") {
                format!("--task={}", task)
            } else {
                arg
            }
        })
        .collect()
}

fn check_paths(args: &Args) -> Result<()> {
    if !args.input.exists() {
        return Err(SegError::Config(format!(
            "input file does not exist: {}",
            args.input.display()
        )));
    }
    for (role, path) in [("input", &args.input), ("output", &args.output)] {
        if !io::has_supported_extension(path) {
            return Err(SegError::Format(format!(
                "unsupported {} extension: {} (supported: {})",
                role,
                path.display(),
                SUPPORTED_EXTENSIONS.join(", ")
            )));
        }
    }
    if let Some(parent) = args.output.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<PipelineConfig> {
    let config = match path {
        Some(path) => PipelineConfig::load(path)?,
        None => PipelineConfig::default(),
    };
    config.validate()?;
    Ok(config)
}

fn run(args: &Args) -> Result<()> {
    check_paths(args)?;
    let config = load_config(args.config.as_deref())?;

    let gpus = args
        .gpu
        .clone()
        .unwrap_or_else(|| std::env::var("CUDA_VISIBLE_DEVICES").unwrap_or_default());
    let assignment = DeviceAssignment::parse(&gpus, args.cpu.unwrap_or(config.cpu_workers))?;
    let speed = SpeedMode::from_fast_flag(args.fast);

    let input = io::read_volume(&args.input)?;
    tracing::info!(
        input = %args.input.display(),
        shape = ?input.shape(),
        spacing = ?input.geometry().spacing(),
        "Loaded input image"
    );

    let hub = CacheHub::from_config(&config);
    let backend = VoxelLinearBackend;
    let orchestrator = Orchestrator::new(&backend, &hub, &config);
    let (labels, report) = orchestrator.run_with_report(args.task, speed, &input, &assignment)?;

    io::write_labels(&args.output, &labels)?;
    tracing::info!(
        run = %report.id,
        output = %args.output.display(),
        labels = labels.label_counts().len(),
        "Segmentation written"
    );
    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse_from(normalize_args(std::env::args()));

    let default_filter = if args.quiet { "organseg=warn" } else { "organseg=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    match run(&args) {
        Ok(()) => {
            if !args.quiet {
                println!("Done. Segmentation saved to: {}", args.output.display());
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = %e, "Segmentation failed");
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
