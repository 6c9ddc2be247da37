//! # femtoscan
//!
//! Measurement execution engine for pump-probe experiments. The crate runs
//! two kinds of acquisition against a shared set of instruments:
//!
//! - **Parameter sweeps**: every combination of the configured sweep values
//!   is applied to the instruments, and a pluggable scan type measures at each
//!   point and writes into a hierarchical output sink.
//! - **Streaming fast scans**: a digitizer is read continuously, frames are
//!   projected onto the delay axis by a pool of processor threads and folded
//!   into a running average, optionally fitted on the fly.
//!
//! ## Crate Structure
//!
//! - **`config`**: `Settings` loaded from `config/femtoscan.toml` and
//!   `FEMTOSCAN_*` environment variables via figment.
//! - **`error`**: the `DaqError` enum used across the crate.
//! - **`logging`**: `tracing` subscriber setup.
//! - **`hardware`**: capability traits, instrument handles, the hardware
//!   arbiter and mock devices.
//! - **`data`**: output sink, frame projection and averaging, peak fitting.
//! - **`experiment`**: sweep plan, scan types, sweep worker and the
//!   `ExperimentCoordinator`.
//! - **`acquisition`**: producer, processing pool, aggregator and the
//!   `AcquisitionCoordinator`.
//! - **`procedures`**: shaker calibration.

pub mod acquisition;
pub mod config;
pub mod data;
pub mod error;
pub mod experiment;
pub mod hardware;
pub mod logging;
pub mod procedures;

pub use acquisition::{AcquisitionCoordinator, StreamEvent};
pub use error::{AppResult, DaqError};
pub use experiment::{ExperimentCoordinator, SweepEvent};
