//! Sweep worker state, progress and lifecycle events.

use crate::experiment::plan::SweepPlan;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Sweep worker lifecycle state.
///
/// # State Machine
///
/// ```text
/// Loading ──> Idle ──> ChangingParameters <──> Running ──> Complete
///    │          │              │                  │
///    └──────────┴──────────────┴──────────────────┴──────> Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerState {
    /// Worker constructed, resources being prepared
    Loading,
    /// Ready, nothing applied yet
    Idle,
    /// Applying the setters of changed dimensions
    ChangingParameters,
    /// Measurement hook executing
    Running,
    /// Unrecoverable error
    Failed,
    /// All tuples done, or stopped at a tuple boundary
    Complete,
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerState::Loading => write!(f, "loading"),
            WorkerState::Idle => write!(f, "idle"),
            WorkerState::ChangingParameters => write!(f, "changing_parameters"),
            WorkerState::Running => write!(f, "running"),
            WorkerState::Failed => write!(f, "failed"),
            WorkerState::Complete => write!(f, "complete"),
        }
    }
}

impl WorkerState {
    /// Terminal states end the worker
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkerState::Failed | WorkerState::Complete)
    }

    /// Whether `next` is a legal successor of this state.
    pub fn can_transition_to(&self, next: WorkerState) -> bool {
        use WorkerState::*;
        match (self, next) {
            (Failed | Complete, _) => false,
            (_, Failed) => true,
            (Loading, Idle) => true,
            (Idle, ChangingParameters | Running | Complete) => true,
            (ChangingParameters, Running) => true,
            (Running, ChangingParameters | Running | Complete) => true,
            _ => false,
        }
    }
}

/// Step counter of a sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressState {
    /// Completed steps
    pub current_step: usize,
    /// steps_per_point × ∏ dimension lengths
    pub total_steps: usize,
}

impl ProgressState {
    /// Progress of a plan with `steps_per_point` hook steps per tuple
    pub fn for_plan(plan: &SweepPlan, steps_per_point: usize) -> Self {
        Self {
            current_step: 0,
            total_steps: steps_per_point * plan.tuple_count(),
        }
    }

    /// 100 × current / total (100 for an empty sweep)
    pub fn percentage(&self) -> f64 {
        if self.total_steps == 0 {
            100.0
        } else {
            100.0 * self.current_step as f64 / self.total_steps as f64
        }
    }
}

/// One measured point, published as `newData`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSample {
    /// Sink group of the current coordinate tuple
    pub group: String,
    /// Average index
    pub average: usize,
    /// Nominal position
    pub position: f64,
    /// Read-back position (nominal if readback failed)
    pub real_position: f64,
    /// Channel values
    pub values: BTreeMap<String, f64>,
}

/// How a sweep ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepOutcome {
    /// Unique run identifier
    pub run_id: String,
    /// Final state (`Complete` for successful or stopped sweeps)
    pub state: WorkerState,
    /// Final progress
    pub progress: ProgressState,
    /// Coordinate tuples measured
    pub tuples_completed: usize,
    /// Whether the run stopped early on request
    pub stopped_early: bool,
}

/// Lifecycle notifications of a sweep.
#[derive(Debug, Clone, PartialEq)]
pub enum SweepEvent {
    /// `stateChanged`
    StateChanged(WorkerState),
    /// `progressChanged`
    Progress {
        /// Completed steps
        current: usize,
        /// Total steps
        total: usize,
        /// 0..=100
        percentage: f64,
    },
    /// `newData`
    NewData(DataSample),
    /// `error`
    Error(String),
    /// `finished`
    Finished(SweepOutcome),
}

/// Cooperative stop flag, checked once per coordinate tuple.
#[derive(Debug, Clone, Default)]
pub struct StopHandle {
    flag: Arc<AtomicBool>,
}

impl StopHandle {
    /// Unset flag
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the sweep to finish after the tuple in progress
    pub fn request_stop(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Whether a stop was requested
    pub fn is_stop_requested(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Clear the flag before a new run
    pub fn reset(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}
