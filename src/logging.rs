//! Structured logging setup.
//!
//! Everything in the crate logs through `tracing`. [`init`] installs one
//! global subscriber: a console layer in the configured [`LogFormat`], and
//! optionally a plain-text file layer so a long sweep leaves a record next
//! to its data. `RUST_LOG` overrides the configured level.
//!
//! Processor and producer threads are named (`femtoscan-worker-N`,
//! `femtoscan-producer`), so thread names are on by default.
//!
//! # Example
//! ```no_run
//! use femtoscan::{config::Settings, logging};
//! use tracing::{info, warn};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let settings = Settings::load()?;
//! logging::init_from_settings(&settings)?;
//!
//! info!("Application started");
//! warn!(instrument = "delay_stage", "Readback unavailable");
//! # Ok(())
//! # }
//! ```

pub use crate::config::LogFormat;
use crate::config::Settings;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan, MakeWriter},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Logging options
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Level used when `RUST_LOG` is not set
    pub level: Level,
    /// Console line format
    pub format: LogFormat,
    /// Log span NEW/CLOSE events (sweep steps, calibration runs)
    pub span_events: bool,
    /// Source file and line of each event
    pub file_and_line: bool,
    /// Name of the emitting thread
    pub thread_names: bool,
    /// Colors on the console (pretty and compact); file output is always plain
    pub ansi: bool,
    /// Append-only log file
    pub file: Option<PathBuf>,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Compact,
            span_events: false,
            file_and_line: false,
            thread_names: true,
            ansi: true,
            file: None,
        }
    }
}

impl TracingConfig {
    /// Options from the `[application]` section
    pub fn from_settings(settings: &Settings) -> Result<Self, String> {
        let app = &settings.application;
        Ok(Self {
            level: parse_log_level(&app.log_level)?,
            format: app.log_format,
            file: app.log_file.clone(),
            ..Default::default()
        })
    }

    /// Defaults at `level`
    pub fn new(level: Level) -> Self {
        Self {
            level,
            ..Default::default()
        }
    }

    /// Console format
    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    /// Span NEW/CLOSE events on or off
    pub fn with_span_events(mut self, enabled: bool) -> Self {
        self.span_events = enabled;
        self
    }

    /// Console colors on or off
    pub fn with_ansi(mut self, enabled: bool) -> Self {
        self.ansi = enabled;
        self
    }

    /// Also append to `path`
    pub fn with_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.file = Some(path.into());
        self
    }

    fn span_events(&self) -> FmtSpan {
        if self.span_events {
            FmtSpan::NEW | FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        }
    }

    /// Console layer in the configured format.
    fn console_layer(&self) -> BoxedLayer {
        self.console_layer_with(std::io::stdout)
    }

    fn console_layer_with<W>(&self, writer: W) -> BoxedLayer
    where
        W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
    {
        let base = fmt::layer()
            .with_writer(writer)
            .with_span_events(self.span_events())
            .with_file(self.file_and_line)
            .with_line_number(self.file_and_line)
            .with_thread_names(self.thread_names);
        match self.format {
            LogFormat::Pretty => base.pretty().with_ansi(self.ansi).boxed(),
            LogFormat::Compact => base.compact().with_ansi(self.ansi).boxed(),
            LogFormat::Json => base.json().boxed(),
        }
    }

    /// Plain compact lines appended to `path`.
    fn file_layer(&self, path: &Path) -> Result<BoxedLayer, String> {
        let file = open_log_file(path)?;
        Ok(fmt::layer()
            .compact()
            .with_ansi(false)
            .with_thread_names(self.thread_names)
            .with_span_events(self.span_events())
            .with_writer(Mutex::new(file))
            .boxed())
    }
}

fn open_log_file(path: &Path) -> Result<File, String> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .map_err(|e| format!("Cannot create log directory {}: {e}", parent.display()))?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| format!("Cannot open log file {}: {e}", path.display()))
}

/// Install the subscriber described by the application settings.
pub fn init_from_settings(settings: &Settings) -> Result<(), String> {
    init(TracingConfig::from_settings(settings)?)
}

/// Install the global subscriber.
///
/// Returns `Ok(())` without doing anything if a subscriber is already set,
/// which is the normal case under test harnesses.
pub fn init(config: TracingConfig) -> Result<(), String> {
    if tracing::dispatcher::has_been_set() {
        return Ok(());
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.as_str().to_lowercase()));

    let mut layers = vec![config.console_layer()];
    if let Some(path) = &config.file {
        layers.push(config.file_layer(path)?);
    }

    match tracing_subscriber::registry()
        .with(layers.with_filter(filter))
        .try_init()
    {
        Ok(()) => Ok(()),
        // Lost a race with another initializer.
        Err(_) if tracing::dispatcher::has_been_set() => Ok(()),
        Err(e) => Err(format!("Failed to initialize tracing: {e}")),
    }
}

fn parse_log_level(level: &str) -> Result<Level, String> {
    level.parse::<Level>().map_err(|_| {
        format!("Invalid log level '{level}'. Must be one of: trace, debug, info, warn, error")
    })
}
