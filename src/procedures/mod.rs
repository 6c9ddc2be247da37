//! Calibration procedures.
//!
//! Procedures drive the shared hardware for a bounded time and return a
//! result the caller may choose to persist. They do not claim the hardware
//! themselves; the owning coordinator holds the arbiter guard around them.

pub mod shaker_calibration;

pub use shaker_calibration::{analyze, probe_positions, CalibrationPoint, CalibrationResult};
