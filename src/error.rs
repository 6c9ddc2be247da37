//! Custom error types for the measurement engine.
//!
//! This module defines the primary error type, `DaqError`, shared by the sweep
//! path and the streaming path. Using the `thiserror` crate, it provides a
//! centralized way to classify what can go wrong, from malformed configuration
//! to hardware contention.
//!
//! ## Error Hierarchy
//!
//! - **`Validation`**: malformed configuration or arguments (type/shape
//!   mismatch, unknown setter, empty value sequence). Raised at call time,
//!   before any state is mutated.
//! - **`Requirement`**: a required instrument role or the output sink is
//!   missing. Raised before a measurement touches hardware.
//! - **`MeasurementHookMissing`**: the scan type has no measurement hook. This
//!   is a programming error and is never recoverable.
//! - **`ReadbackUnavailable`** and **`FitNotConverged`**: per-item failures.
//!   The caller substitutes a nominal value or skips the result and carries on.
//! - **`ResourceBusy`**: the shared hardware is held by another path (sweep,
//!   streaming or calibration).
//! - **`NameCollision`**: an output sink already exists at the target path.
//! - **`CapabilityMissing`**: a device does not implement an optional
//!   operation. Hard-stop teardown swallows this one.
//! - **`ShutdownFailed`**: several independent teardown attempts failed; every
//!   individual failure is kept.
//!
//! By using `#[from]`, `DaqError` can be created from the underlying I/O,
//! serialization and configuration errors with the `?` operator.

use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

#[derive(Error, Debug)]
#[allow(missing_docs)]
pub enum DaqError {
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Requirements not met: {}", .0.join(", "))]
    Requirement(Vec<String>),

    #[error("Scan type '{0}' does not implement a measurement hook")]
    MeasurementHookMissing(String),

    #[error("Readback unavailable: {0}")]
    ReadbackUnavailable(String),

    #[error("Fit did not converge: {0}")]
    FitNotConverged(String),

    #[error("Resource busy: {0}")]
    ResourceBusy(String),

    #[error("Output already exists: {0}")]
    NameCollision(std::path::PathBuf),

    #[error("Capability not supported: {0}")]
    CapabilityMissing(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Instrument error: {0}")]
    Instrument(String),

    #[error("Data processing error: {0}")]
    Processing(String),

    #[error("Shutdown failed with errors: {}", .0.iter().map(|e| e.to_string()).collect::<Vec<_>>().join("; "))]
    ShutdownFailed(Vec<DaqError>),
}

impl From<figment::Error> for DaqError {
    fn from(err: figment::Error) -> Self {
        DaqError::Config(Box::new(err))
    }
}

impl DaqError {
    /// Wrap a hardware-layer error, keeping the full context chain.
    ///
    /// Capability traits report `anyhow::Error`. When the source already is a
    /// `DaqError::CapabilityMissing` it is preserved so teardown can tell it
    /// apart from real failures.
    pub fn from_hardware(err: anyhow::Error) -> Self {
        match err.downcast::<DaqError>() {
            Ok(inner) => inner,
            Err(other) => DaqError::Instrument(format!("{other:#}")),
        }
    }

    /// Whether the operation that produced this error can simply continue.
    pub fn is_recoverable(&self) -> bool {
        match self {
            DaqError::ReadbackUnavailable(_)
            | DaqError::FitNotConverged(_)
            | DaqError::ResourceBusy(_)
            | DaqError::CapabilityMissing(_)
            | DaqError::Instrument(_)
            | DaqError::Processing(_) => true,
            DaqError::Config(_)
            | DaqError::Validation(_)
            | DaqError::Requirement(_)
            | DaqError::MeasurementHookMissing(_)
            | DaqError::NameCollision(_)
            | DaqError::Io(_)
            | DaqError::Serialization(_)
            | DaqError::ShutdownFailed(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hardware_errors_keep_capability_variant() {
        let err = anyhow::Error::new(DaqError::CapabilityMissing("disconnect".into()));
        assert!(matches!(
            DaqError::from_hardware(err),
            DaqError::CapabilityMissing(op) if op == "disconnect"
        ));

        let err = anyhow::anyhow!("serial timeout").context("moving stage");
        match DaqError::from_hardware(err) {
            DaqError::Instrument(msg) => {
                assert!(msg.contains("moving stage"));
                assert!(msg.contains("serial timeout"));
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn shutdown_failure_lists_every_error() {
        let err = DaqError::ShutdownFailed(vec![
            DaqError::Instrument("stage".into()),
            DaqError::Instrument("lockin".into()),
        ]);
        let msg = err.to_string();
        assert!(msg.contains("stage"));
        assert!(msg.contains("lockin"));
        assert!(!err.is_recoverable());
    }

    #[test]
    fn requirement_names_missing_roles() {
        let err = DaqError::Requirement(vec!["delay_stage".into(), "output sink".into()]);
        assert_eq!(
            err.to_string(),
            "Requirements not met: delay_stage, output sink"
        );
    }

    #[test]
    fn recoverability_classification() {
        assert!(DaqError::FitNotConverged("singular".into()).is_recoverable());
        assert!(DaqError::ReadbackUnavailable("stage".into()).is_recoverable());
        assert!(!DaqError::MeasurementHookMissing("generic".into()).is_recoverable());
        assert!(!DaqError::Validation("bad".into()).is_recoverable());
    }
}
