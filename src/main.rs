//! CLI entry point for femtoscan
//!
//! Runs the measurement engine against simulated hardware:
//! - `sweep`: step scan at a list of cryostat temperatures
//! - `stream`: fast-scan streaming for a fixed time, then save a snapshot
//! - `calibrate`: shaker calibration against the simulated delay line
//! - `config`: print the effective configuration
//!
//! # Usage
//!
//! ```bash
//! femtoscan sweep --temperatures 10,20,30 --name dyes
//! femtoscan stream --seconds 5
//! FEMTOSCAN_FASTSCAN__N_AVERAGES=50 femtoscan stream
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use femtoscan::acquisition::{AcquisitionCoordinator, SharedSource, StreamEvent};
use femtoscan::config::Settings;
use femtoscan::experiment::{ExperimentCoordinator, StepScan, SweepEvent};
use femtoscan::hardware::mock::{
    AutocorrelatorParams, MockCryostat, MockLockIn, MockStage, SimulatedAutocorrelator,
};
use femtoscan::hardware::{FrameSource, HardwareArbiter, Movable};
use femtoscan::logging;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "femtoscan")]
#[command(about = "Pump-probe measurement engine (simulated hardware)", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Output directory (defaults to paths.data_dir)
    #[arg(long, global = true)]
    output: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Step scan swept over cryostat temperatures
    Sweep {
        /// Measurement name, also the output file stem
        #[arg(long)]
        name: Option<String>,

        /// Temperatures in K
        #[arg(long, value_delimiter = ',', default_value = "10,20")]
        temperatures: Vec<f64>,

        /// Overwrite an existing output file
        #[arg(long)]
        replace: bool,
    },

    /// Stream fast scans and save a snapshot at the end
    Stream {
        /// Streaming duration
        #[arg(long, default_value = "5")]
        seconds: u64,

        /// Fit every new running average
        #[arg(long)]
        fit: bool,

        /// Snapshot file stem
        #[arg(long, default_value = "fastscan")]
        name: String,
    },

    /// Calibrate the shaker delay per step
    Calibrate,

    /// Print the effective configuration as TOML
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings = match &cli.config {
        Some(path) => Settings::load_from(path),
        None => Settings::load(),
    }
    .context("loading configuration")?;
    settings.validate()?;
    logging::init_from_settings(&settings).map_err(anyhow::Error::msg)?;

    let output = cli
        .output
        .clone()
        .unwrap_or_else(|| settings.paths.data_dir.clone());

    match cli.command {
        Commands::Sweep {
            name,
            temperatures,
            replace,
        } => run_sweep(&settings, output, name, temperatures, replace).await,
        Commands::Stream { seconds, fit, name } => {
            run_stream(&settings, output, Duration::from_secs(seconds), fit, &name).await
        }
        Commands::Calibrate => run_calibration(&settings).await,
        Commands::Config => {
            print!("{}", settings.to_toml()?);
            Ok(())
        }
    }
}

async fn run_sweep(
    settings: &Settings,
    output: PathBuf,
    name: Option<String>,
    temperatures: Vec<f64>,
    replace: bool,
) -> Result<()> {
    let stage = Arc::new(MockStage::new());
    let lockin = Arc::new(MockLockIn::tracking(stage.clone()));
    let cryostat = Arc::new(MockCryostat::new());

    let scan = Arc::new(StepScan::new(settings.stepscan.clone())?);
    let mut coordinator = ExperimentCoordinator::new(scan, HardwareArbiter::new());
    if let Some(name) = name {
        coordinator.set_name(name);
    }
    coordinator.add_instrument("delay_stage", stage.handle())?;
    coordinator.add_instrument("lockin", lockin.handle())?;
    coordinator.add_instrument("cryostat", cryostat.handle())?;
    coordinator.add_parameter_iteration("temperature", "K", "cryostat", "set_temperature", temperatures)?;
    coordinator.connect_all().await?;

    let file_name = coordinator.name().replace([' ', ':'], "_");
    let path = coordinator.create_file(&file_name, &output, replace).await?;
    println!("{}", coordinator.describe_setup());

    let mut events = coordinator.subscribe();
    let printer = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                SweepEvent::Progress { percentage, .. } => info!("progress {percentage:.1}%"),
                SweepEvent::StateChanged(state) => info!(%state, "sweep state"),
                SweepEvent::Error(message) => warn!("sweep error: {message}"),
                SweepEvent::Finished(_) => break,
                SweepEvent::NewData(_) => {}
            }
        }
    });

    let kill = coordinator.kill_switch();
    let outcome = tokio::select! {
        outcome = coordinator.start_measurement() => outcome?,
        _ = tokio::signal::ctrl_c() => {
            warn!("interrupted, stopping hardware");
            kill.kill().await?;
            anyhow::bail!("measurement interrupted");
        }
    };
    let _ = printer.await;
    coordinator.disconnect_all().await?;

    println!(
        "{} finished: {} ({} of {} steps) -> {}",
        outcome.run_id,
        outcome.state,
        outcome.progress.current_step,
        outcome.progress.total_steps,
        path.display()
    );
    Ok(())
}

fn simulated_delay_line(settings: &Settings) -> (Arc<MockStage>, SharedSource) {
    let stage = Arc::new(MockStage::new());
    let params = AutocorrelatorParams {
        position_step: settings.fastscan.shaker_position_step,
        noise: 0.01,
        ..Default::default()
    };
    let source: Box<dyn FrameSource> =
        Box::new(SimulatedAutocorrelator::with_stage(params, stage.clone()));
    (stage, Arc::new(Mutex::new(source)))
}

async fn run_stream(
    settings: &Settings,
    output: PathBuf,
    duration: Duration,
    fit: bool,
    name: &str,
) -> Result<()> {
    let (stage, source) = simulated_delay_line(settings);
    let stage: Arc<dyn Movable> = stage;
    let acquisition =
        AcquisitionCoordinator::new(settings.fastscan.clone(), source, stage, HardwareArbiter::new())?;
    acquisition.set_fit_autocorrelation(fit);

    let mut events = acquisition.subscribe();
    let printer = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(StreamEvent::FitResult { seq, fit }) => {
                    info!(seq, center = fit.center, fwhm = fit.fwhm, "fit")
                }
                Ok(StreamEvent::Error(message)) => warn!("stream error: {message}"),
                Ok(StreamEvent::Stopped) => break,
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "event printer lagging")
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    acquisition.start_streamer()?;
    tokio::select! {
        _ = tokio::time::sleep(duration) => {}
        _ = tokio::signal::ctrl_c() => warn!("interrupted"),
    }
    acquisition.stop_streamer();
    let _ = printer.await;

    let path = acquisition.save_snapshot(&output, name, true)?;
    println!(
        "averaged {} curves ({} frames dropped) -> {}",
        acquisition.history_len(),
        acquisition.dropped_frames(),
        path.display()
    );
    Ok(())
}

async fn run_calibration(settings: &Settings) -> Result<()> {
    let (stage, source) = simulated_delay_line(settings);
    let stage: Arc<dyn Movable> = stage;
    let acquisition =
        AcquisitionCoordinator::new(settings.fastscan.clone(), source, stage, HardwareArbiter::new())?;

    let result = acquisition.calibrate_shaker(&settings.calibration).await?;
    println!(
        "shaker: {:.6} ps/step (pairwise mean {:.6}), {} of {} points kept",
        result.slope,
        result.mean_pairwise_slope,
        result.second_pass_kept,
        result.points.len()
    );
    acquisition.set_shaker_ps_per_step(result.slope)?;
    Ok(())
}
