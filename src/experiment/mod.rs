//! Parameter sweeps.
//!
//! - [`plan`]: sweep dimensions and odometer enumeration
//! - [`state`]: worker states, progress and lifecycle events
//! - [`scan`]: the per-tuple measurement hook (`StepScan`, `GenericScan`)
//! - [`worker`]: sweep execution and hard stop
//! - [`coordinator`]: instrument registry, sink creation, measurement launch

pub mod coordinator;
pub mod plan;
pub mod scan;
pub mod state;
pub mod worker;

pub use coordinator::ExperimentCoordinator;
pub use plan::{CoordinateIter, ParameterIteration, SweepPlan};
pub use scan::{GenericScan, MeasureContext, ScanType, SharedSink, StepScan};
pub use state::{DataSample, ProgressState, StopHandle, SweepEvent, SweepOutcome, WorkerState};
pub use worker::{KillSwitch, SweepWorker};
