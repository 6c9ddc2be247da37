//! Configuration System using Figment
//!
//! Configuration is an immutable snapshot. It is loaded once from:
//! 1. `config/femtoscan.toml` (base configuration)
//! 2. Environment variables (prefixed with `FEMTOSCAN_`, sections split on `__`)
//!
//! Components receive the snapshot (or the section they need) at construction
//! and never re-read configuration behind the caller's back.
//!
//! # Example
//! ```no_run
//! use femtoscan::config::Settings;
//!
//! let settings = Settings::load()?;
//! settings.validate()?;
//! println!("Averaging window: {}", settings.fastscan.n_averages);
//! # Ok::<(), femtoscan::error::DaqError>(())
//! ```

use crate::error::{AppResult, DaqError};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default location of the configuration file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/femtoscan.toml";

/// Shaker amplifier gains accepted by the acquisition hardware.
pub const VALID_SHAKER_GAINS: [u32; 3] = [1, 10, 100];

/// Top-level configuration snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Settings {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Filesystem locations
    #[serde(default)]
    pub paths: PathsConfig,
    /// Streaming (fast scan) acquisition
    #[serde(default)]
    pub fastscan: FastScanConfig,
    /// Step scan defaults
    #[serde(default)]
    pub stepscan: StepScanConfig,
    /// Shaker calibration routine
    #[serde(default)]
    pub calibration: CalibrationConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_app_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log line format
    #[serde(default)]
    pub log_format: LogFormat,
    /// Also append log lines to this file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,
}

/// How log lines are rendered
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Multi-line, colored
    Pretty,
    #[default]
    Compact,
    /// One JSON object per line
    Json,
}

/// Where measurement files are written
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Directory for output sinks
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

/// Streaming pipeline configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FastScanConfig {
    /// Worker threads projecting frames. Must be below the CPU count.
    #[serde(default = "default_n_processors")]
    pub n_processors: usize,
    /// Sliding window size of the running average
    #[serde(default = "default_n_averages")]
    pub n_averages: usize,
    /// Samples per raw frame
    #[serde(default = "default_n_samples")]
    pub n_samples: usize,
    /// Alternate pumped/unpumped samples and subtract the unpumped ones
    #[serde(default)]
    pub dark_control: bool,
    /// Shaker position signal per step
    #[serde(default = "default_shaker_position_step")]
    pub shaker_position_step: f64,
    /// Delay time per shaker step (ps)
    #[serde(default = "default_shaker_ps_per_step")]
    pub shaker_ps_per_step: f64,
    /// Shaker amplifier gain (1, 10 or 100)
    #[serde(default = "default_shaker_gain")]
    pub shaker_gain: u32,
    /// Fit every running average with an autocorrelation peak
    #[serde(default)]
    pub fit_autocorrelation: bool,
    /// Initial width guess for the peak fit (ps)
    #[serde(default = "default_expected_pulse_duration")]
    pub expected_pulse_duration: f64,
    /// Capacity of the frame queue between producer and pool
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Lifecycle tick interval in milliseconds
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    /// Apply processed curves in acquisition order instead of completion order
    #[serde(default = "default_true")]
    pub reorder_frames: bool,
}

/// Step scan defaults
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepScanConfig {
    /// Repetitions of the full position list
    #[serde(default = "default_stepscan_averages")]
    pub averages: usize,
    /// Stage positions, strictly increasing
    #[serde(default = "default_stage_positions")]
    pub stage_positions: Vec<f64>,
    /// Stage position of zero delay
    #[serde(default = "default_time_zero")]
    pub time_zero: f64,
    /// Lock-in channels read at every position
    #[serde(default = "default_channels")]
    pub channels: Vec<String>,
}

/// Shaker calibration routine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationConfig {
    /// Number of probe positions (even; half forward, half reverse)
    #[serde(default = "default_calibration_iterations")]
    pub iterations: usize,
    /// Frames integrated per single shot
    #[serde(default = "default_integration")]
    pub integration: usize,
    /// Fraction of the measured time window used as probe range
    #[serde(default = "default_range_fraction")]
    pub range_fraction: f64,
}

// Default value functions
fn default_app_name() -> String {
    "femtoscan".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_n_processors() -> usize {
    available_cpus().saturating_sub(1).clamp(1, 2)
}

fn default_n_averages() -> usize {
    10
}

fn default_n_samples() -> usize {
    6000
}

fn default_shaker_position_step() -> f64 {
    0.000152
}

fn default_shaker_ps_per_step() -> f64 {
    0.05
}

fn default_shaker_gain() -> u32 {
    1
}

fn default_expected_pulse_duration() -> f64 {
    0.1
}

fn default_queue_capacity() -> usize {
    64
}

fn default_tick_interval_ms() -> u64 {
    50
}

fn default_true() -> bool {
    true
}

fn default_stepscan_averages() -> usize {
    2
}

fn default_stage_positions() -> Vec<f64> {
    let (start, stop, n) = (-1.0, 3.0, 10);
    (0..n)
        .map(|i| start + (stop - start) * i as f64 / (n - 1) as f64)
        .collect()
}

fn default_time_zero() -> f64 {
    -0.5
}

fn default_channels() -> Vec<String> {
    vec!["X".to_string(), "Y".to_string()]
}

fn default_calibration_iterations() -> usize {
    20
}

fn default_integration() -> usize {
    1
}

fn default_range_fraction() -> f64 {
    0.7
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_app_name(),
            log_level: default_log_level(),
            log_format: LogFormat::default(),
            log_file: None,
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

impl Default for FastScanConfig {
    fn default() -> Self {
        Self {
            n_processors: default_n_processors(),
            n_averages: default_n_averages(),
            n_samples: default_n_samples(),
            dark_control: false,
            shaker_position_step: default_shaker_position_step(),
            shaker_ps_per_step: default_shaker_ps_per_step(),
            shaker_gain: default_shaker_gain(),
            fit_autocorrelation: false,
            expected_pulse_duration: default_expected_pulse_duration(),
            queue_capacity: default_queue_capacity(),
            tick_interval_ms: default_tick_interval_ms(),
            reorder_frames: default_true(),
        }
    }
}

impl Default for StepScanConfig {
    fn default() -> Self {
        Self {
            averages: default_stepscan_averages(),
            stage_positions: default_stage_positions(),
            time_zero: default_time_zero(),
            channels: default_channels(),
        }
    }
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            iterations: default_calibration_iterations(),
            integration: default_integration(),
            range_fraction: default_range_fraction(),
        }
    }
}

/// Number of hardware threads, falling back to 1 when it cannot be queried.
pub fn available_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

impl Settings {
    /// Load configuration from `config/femtoscan.toml` and environment variables
    ///
    /// Environment variables override the file with prefix `FEMTOSCAN_`.
    /// Example: `FEMTOSCAN_FASTSCAN__N_AVERAGES=25`
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path. A missing file yields
    /// the defaults (plus environment overrides).
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let settings = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("FEMTOSCAN_").split("__"))
            .extract()?;
        Ok(settings)
    }

    /// Render the snapshot as TOML, e.g. to seed a configuration file.
    pub fn to_toml(&self) -> AppResult<String> {
        toml::to_string_pretty(self).map_err(|e| DaqError::Validation(e.to_string()))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(DaqError::Validation(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        self.fastscan.validate()?;
        self.stepscan.validate()?;
        self.calibration.validate()?;
        Ok(())
    }
}

impl FastScanConfig {
    /// Check the streaming parameters, including the processor count against
    /// the CPUs of this machine.
    pub fn validate(&self) -> AppResult<()> {
        validate_n_processors(self.n_processors)?;
        if self.n_averages == 0 {
            return Err(DaqError::Validation(
                "n_averages must be greater than zero".into(),
            ));
        }
        if self.n_samples == 0 {
            return Err(DaqError::Validation(
                "n_samples must be greater than zero".into(),
            ));
        }
        validate_shaker_gain(self.shaker_gain)?;
        if !(self.shaker_position_step.is_finite() && self.shaker_position_step > 0.0) {
            return Err(DaqError::Validation(format!(
                "shaker_position_step must be positive, got {}",
                self.shaker_position_step
            )));
        }
        if !(self.shaker_ps_per_step.is_finite() && self.shaker_ps_per_step > 0.0) {
            return Err(DaqError::Validation(format!(
                "shaker_ps_per_step must be positive, got {}",
                self.shaker_ps_per_step
            )));
        }
        if self.queue_capacity == 0 {
            return Err(DaqError::Validation(
                "queue_capacity must be greater than zero".into(),
            ));
        }
        if self.tick_interval_ms == 0 {
            return Err(DaqError::Validation(
                "tick_interval_ms must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

/// Processor count must leave at least one CPU for the producer. A single
/// CPU machine still gets one processor.
pub fn validate_n_processors(n_processors: usize) -> AppResult<()> {
    let limit = available_cpus().saturating_sub(1).max(1);
    if n_processors == 0 || n_processors > limit {
        return Err(DaqError::Validation(format!(
            "n_processors must be between 1 and {limit} on this machine, got {n_processors}"
        )));
    }
    Ok(())
}

/// Gain must be one the amplifier supports.
pub fn validate_shaker_gain(gain: u32) -> AppResult<()> {
    if !VALID_SHAKER_GAINS.contains(&gain) {
        return Err(DaqError::Validation(format!(
            "shaker_gain must be one of {:?}, got {}",
            VALID_SHAKER_GAINS, gain
        )));
    }
    Ok(())
}

impl StepScanConfig {
    /// Averages positive, positions non-empty and strictly increasing.
    pub fn validate(&self) -> AppResult<()> {
        if self.averages == 0 {
            return Err(DaqError::Validation(
                "averages must be greater than zero".into(),
            ));
        }
        if self.stage_positions.is_empty() {
            return Err(DaqError::Validation("stage_positions is empty".into()));
        }
        if self.stage_positions.iter().any(|p| !p.is_finite()) {
            return Err(DaqError::Validation(
                "stage_positions must be finite".into(),
            ));
        }
        if self.stage_positions.windows(2).any(|w| w[1] <= w[0]) {
            return Err(DaqError::Validation(
                "stage_positions must be monotonically increasing".into(),
            ));
        }
        if !self.time_zero.is_finite() {
            return Err(DaqError::Validation("time_zero must be finite".into()));
        }
        if self.channels.is_empty() {
            return Err(DaqError::Validation("channels is empty".into()));
        }
        Ok(())
    }
}

impl CalibrationConfig {
    /// Iterations even and at least 4, integration positive, fraction in (0, 1].
    pub fn validate(&self) -> AppResult<()> {
        if self.iterations < 4 || self.iterations % 2 != 0 {
            return Err(DaqError::Validation(format!(
                "calibration iterations must be even and at least 4, got {}",
                self.iterations
            )));
        }
        if self.integration == 0 {
            return Err(DaqError::Validation(
                "calibration integration must be greater than zero".into(),
            ));
        }
        if !(self.range_fraction > 0.0 && self.range_fraction <= 1.0) {
            return Err(DaqError::Validation(format!(
                "range_fraction must be in (0, 1], got {}",
                self.range_fraction
            )));
        }
        Ok(())
    }
}
