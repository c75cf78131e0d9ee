use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use rigcal::board::BoardGeometry;
use rigcal::calibration::{self, solver::OpenCvSolver};
use rigcal::camera::capture::OpenCvDriver;
use rigcal::camera::worker::list_available_sources;
use rigcal::cancel::StopToken;
use rigcal::config::Config;
use rigcal::detection::charuco::CharucoBoardDetector;
use rigcal::events::source::Evt2Driver;
use rigcal::job::{self, JobData, JobPaths};
use rigcal::session::{Drivers, RecordingSession, Viewer};

#[derive(Parser)]
#[command(name = "rigcal", version, about = "Record and calibrate multi-camera rigs")]
struct Cli {
    /// Rig configuration
    #[arg(short, long, global = true, default_value = "config.toml")]
    config: PathBuf,

    /// Overrides `recording.data_dir`
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Capture synchronized board samples into a new job
    Record {
        /// Job name, defaults to a timestamp
        #[arg(long)]
        job: Option<String>,
        /// Replace the frames of an existing job
        #[arg(long)]
        overwrite: bool,
        #[arg(long)]
        no_viewer: bool,
    },
    /// List the devices each backend can see
    Cameras,
    /// List recorded jobs and their state
    Jobs,
    /// Promote raw samples to the verified set
    Verify {
        job: String,
        /// Frame ids to leave out
        #[arg(long, value_delimiter = ',')]
        exclude: Vec<u64>,
    },
    /// Calibrate a verified job
    Calibrate {
        job: String,
        #[arg(value_enum)]
        mode: CalibrationMode,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum CalibrationMode {
    Mono,
    Stereo,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Record { job, overwrite, no_viewer } => {
            let config = Config::load(&cli.config)?;
            let data_dir = cli.data_dir.unwrap_or_else(|| config.recording.data_dir.clone());
            let code = record(config, &data_dir, job, overwrite, no_viewer)?;
            if code != 0 {
                std::process::exit(code);
            }
        }
        Command::Cameras => cameras(&cli.config)?,
        Command::Jobs => {
            let data_dir = data_dir(&cli.config, cli.data_dir);
            for summary in job::list_jobs(&data_dir)? {
                println!(
                    "{:<28} {:>2} cams {:>4} raw {:>4} verified  {:?}{}",
                    summary.id,
                    summary.cameras,
                    summary.raw_sets,
                    summary.verified_sets,
                    summary.status(),
                    if summary.stereo_calibrated { " +stereo" } else { "" }
                );
            }
        }
        Command::Verify { job, exclude } => {
            let job = JobPaths::in_data_dir(&data_dir(&cli.config, cli.data_dir), &job);
            let report = job::promote(&job, &exclude)?;
            info!(
                job = %job.id(),
                promoted = report.promoted,
                excluded = report.excluded,
                incomplete = report.incomplete,
                "samples verified"
            );
        }
        Command::Calibrate { job, mode } => {
            let job = JobPaths::in_data_dir(&data_dir(&cli.config, cli.data_dir), &job);
            calibrate(&job, mode)?;
        }
    }
    Ok(())
}

/// Data directory from the flag, the config file, or the default.
fn data_dir(config: &Path, flag: Option<PathBuf>) -> PathBuf {
    flag.unwrap_or_else(|| match Config::load(config) {
        Ok(c) => c.recording.data_dir,
        Err(_) => PathBuf::from("data"),
    })
}

fn drivers(config: &Config) -> Drivers {
    Drivers {
        frame: Some(Arc::new(OpenCvDriver::default())),
        event: Some(Arc::new(Evt2Driver::new(config.recording.event_source_dir.clone()))),
    }
}

fn record(config: Config, data_dir: &Path, job: Option<String>, overwrite: bool, no_viewer: bool) -> Result<i32> {
    let stop = StopToken::new();
    stop.register_signals().context("Failed to install signal handlers")?;

    let job = match job {
        Some(id) => JobPaths::in_data_dir(data_dir, &id),
        None => JobPaths::timestamped(data_dir),
    };
    job.prepare_recording(overwrite)?;
    info!(job = %job.root().display(), "recording");

    let detector = CharucoBoardDetector::new(&config.board, &config.detection)?;
    let viewer = if config.viewing.enabled && !no_viewer { viewer(&config) } else { None };
    let session = RecordingSession::new(config.clone(), job, drivers(&config), stop);
    session.run(Box::new(detector), viewer)
}

#[cfg(feature = "viewer")]
fn viewer(config: &Config) -> Option<Viewer> {
    let viewing = config.viewing.clone();
    Some(Box::new(move |roster, samples, stop| rigcal::render::run_viewer(roster, samples, stop, &viewing)))
}

#[cfg(not(feature = "viewer"))]
fn viewer(_config: &Config) -> Option<Viewer> {
    warn!("built without the viewer feature, recording headless");
    None
}

fn cameras(config_path: &Path) -> Result<()> {
    let event_dir = match Config::load(config_path) {
        Ok(c) => c.recording.event_source_dir,
        Err(e) => {
            warn!("{:#}, looking for event recordings in the working directory", e);
            PathBuf::from(".")
        }
    };

    println!("frame cameras:");
    match list_available_sources(&OpenCvDriver::default()) {
        Ok(devices) => {
            for d in devices {
                println!("  {:<12} {} ({})", d.id, d.name, d.transport);
            }
        }
        Err(e) => println!("  {}", e),
    }
    println!("event cameras:");
    match list_available_sources(&Evt2Driver::new(event_dir)) {
        Ok(devices) => {
            for d in devices {
                println!("  {:<12} {} ({})", d.id, d.name, d.transport);
            }
        }
        Err(e) => println!("  {}", e),
    }
    Ok(())
}

fn calibrate(job: &JobPaths, mode: CalibrationMode) -> Result<()> {
    job.require_verified()?;
    let mut manifest = JobData::load(&job.manifest_path())?;
    let config = manifest.config.clone();
    let board = BoardGeometry::from_config(&config.board);
    let threshold = board.corner_threshold(config.detection.minimum_corner_fraction);
    let mut detector = CharucoBoardDetector::new(&config.board, &config.detection)?;
    let solver = OpenCvSolver::default();

    match mode {
        CalibrationMode::Mono => {
            let results = calibration::mono_calibrate(job, &mut manifest, &mut detector, &solver, &board, threshold)?;
            for (camera, result) in &results {
                info!(camera, rms = result.reprojection_error, "camera calibrated");
            }
        }
        CalibrationMode::Stereo => {
            let results =
                calibration::stereo_calibrate(job, &mut manifest, &mut detector, &solver, &board, threshold)?;
            for result in &results {
                info!(
                    left = result.cam_left_id,
                    right = result.cam_right_id,
                    rms = result.extrinsics.reprojection_error,
                    "pair calibrated"
                );
            }
        }
    }
    manifest.save(&job.manifest_path())?;
    info!(manifest = %job.manifest_path().display(), "calibration saved");
    Ok(())
}
