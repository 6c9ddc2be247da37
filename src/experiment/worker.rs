//! Sweep execution.
//!
//! [`SweepWorker`] walks the coordinate tuples of a [`SweepPlan`] in odometer
//! order. Before each tuple it re-applies only the dimensions whose index
//! changed, then runs the scan type's measurement hook. All hardware calls of
//! one sweep happen sequentially inside the worker's task.

use crate::error::{AppResult, DaqError};
use crate::experiment::plan::SweepPlan;
use crate::experiment::scan::{
    CoordinateValue, MeasureContext, ProgressTracker, ScanType, SharedSink,
};
use crate::experiment::state::{
    ProgressState, StopHandle, SweepEvent, SweepOutcome, WorkerState,
};
use crate::hardware::handle::InstrumentHandle;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Executes one sweep. Consumed by [`SweepWorker::run`].
pub struct SweepWorker {
    run_id: String,
    plan: SweepPlan,
    instruments: BTreeMap<String, InstrumentHandle>,
    scan: Arc<dyn ScanType>,
    sink: SharedSink,
    events: broadcast::Sender<SweepEvent>,
    stop: StopHandle,
    state: WorkerState,
}

impl SweepWorker {
    /// Worker bound to a plan, an instrument set and an output sink.
    pub fn new(
        plan: SweepPlan,
        instruments: BTreeMap<String, InstrumentHandle>,
        scan: Arc<dyn ScanType>,
        sink: SharedSink,
        events: broadcast::Sender<SweepEvent>,
        stop: StopHandle,
    ) -> Self {
        Self {
            run_id: Uuid::new_v4().to_string(),
            plan,
            instruments,
            scan,
            sink,
            events,
            stop,
            state: WorkerState::Loading,
        }
    }

    /// Unique identifier of this run
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    fn set_state(&mut self, next: WorkerState) {
        if self.state == next {
            return;
        }
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal transition {} -> {}",
            self.state,
            next
        );
        debug!(from = %self.state, to = %next, "worker state");
        self.state = next;
        let _ = self.events.send(SweepEvent::StateChanged(next));
    }

    /// Run the sweep to completion, cancellation or failure.
    ///
    /// The stop flag is checked before every coordinate tuple; a tuple that
    /// has started always finishes.
    pub async fn run(mut self) -> AppResult<SweepOutcome> {
        let _ = self.events.send(SweepEvent::StateChanged(WorkerState::Loading));
        let steps_per_point = self.scan.steps_per_point();
        let mut tracker = ProgressTracker::new(
            ProgressState::for_plan(&self.plan, steps_per_point),
            self.events.clone(),
        );
        info!(
            run_id = %self.run_id,
            scan = self.scan.tag(),
            tuples = self.plan.tuple_count(),
            total_steps = tracker.state().total_steps,
            "sweep started"
        );
        self.set_state(WorkerState::Idle);

        let mut last_applied: Vec<Option<usize>> = vec![None; self.plan.dimensions().len()];
        let mut tuples_completed = 0;
        let mut stopped_early = false;

        for (tuple, indices) in self.plan.coordinates().enumerate() {
            if self.stop.is_stop_requested() {
                info!(run_id = %self.run_id, tuple, "stop requested, finishing sweep");
                stopped_early = true;
                break;
            }

            if let Err(err) = self
                .run_tuple(&indices, &mut last_applied, &mut tracker)
                .await
            {
                return Err(self.fail(err, &tracker, tuples_completed));
            }
            tracker.advance_to((tuple + 1) * steps_per_point);
            tuples_completed += 1;
        }

        self.set_state(WorkerState::Complete);
        let outcome = SweepOutcome {
            run_id: self.run_id.clone(),
            state: WorkerState::Complete,
            progress: tracker.state(),
            tuples_completed,
            stopped_early,
        };
        info!(
            run_id = %self.run_id,
            tuples_completed,
            stopped_early,
            "sweep complete"
        );
        let _ = self.events.send(SweepEvent::Finished(outcome.clone()));
        Ok(outcome)
    }

    async fn run_tuple(
        &mut self,
        indices: &[usize],
        last_applied: &mut [Option<usize>],
        tracker: &mut ProgressTracker,
    ) -> AppResult<()> {
        let changed: Vec<usize> = indices
            .iter()
            .enumerate()
            .filter(|&(dim, index)| last_applied[dim] != Some(*index))
            .map(|(dim, _)| dim)
            .collect();

        if !changed.is_empty() {
            self.set_state(WorkerState::ChangingParameters);
            for dim in changed {
                let dimension = &self.plan.dimensions()[dim];
                let value = dimension.values[indices[dim]];
                debug!(
                    instrument = %dimension.instrument,
                    method = %dimension.method,
                    value,
                    "applying parameter"
                );
                dimension.setter().call(value).await.map_err(|err| {
                    match DaqError::from_hardware(err) {
                        DaqError::Instrument(msg) => DaqError::Instrument(format!(
                            "{}.{}({value}): {msg}",
                            dimension.instrument, dimension.method
                        )),
                        other => other,
                    }
                })?;
                last_applied[dim] = Some(indices[dim]);
            }
        }
        self.set_state(WorkerState::Running);

        let coordinate: Vec<CoordinateValue> = self
            .plan
            .dimensions()
            .iter()
            .zip(indices)
            .map(|(dim, &i)| CoordinateValue {
                name: dim.name.clone(),
                unit: dim.unit.clone(),
                value: dim.values[i],
            })
            .collect();
        let group = self.plan.group_path(indices);

        let mut ctx = MeasureContext::new(
            coordinate,
            group,
            &self.instruments,
            &self.sink,
            tracker,
            &self.events,
        );
        self.scan.measure(&mut ctx).await
    }

    fn fail(&mut self, err: DaqError, tracker: &ProgressTracker, tuples_completed: usize) -> DaqError {
        error!(run_id = %self.run_id, "sweep failed: {err}");
        self.set_state(WorkerState::Failed);
        let _ = self.events.send(SweepEvent::Error(err.to_string()));
        let _ = self.events.send(SweepEvent::Finished(SweepOutcome {
            run_id: self.run_id.clone(),
            state: WorkerState::Failed,
            progress: tracker.state(),
            tuples_completed,
            stopped_early: false,
        }));
        err
    }
}

/// Hard stop: raise the stop flag and disconnect every instrument.
///
/// Usable while a sweep is running; it does not wait for the current tuple.
#[derive(Debug, Clone)]
pub struct KillSwitch {
    instruments: Vec<(String, InstrumentHandle)>,
    stop: StopHandle,
}

impl KillSwitch {
    /// Kill switch over `instruments`, sharing `stop` with the worker
    pub fn new(instruments: Vec<(String, InstrumentHandle)>, stop: StopHandle) -> Self {
        Self { instruments, stop }
    }

    /// Stop motion and disconnect everything, best effort.
    ///
    /// Every instrument is attempted. Missing capabilities are ignored; all
    /// other failures are logged and returned together.
    pub async fn kill(&self) -> AppResult<()> {
        self.stop.request_stop();
        warn!(instruments = self.instruments.len(), "hard stop");

        let mut failures = Vec::new();
        for (name, handle) in &self.instruments {
            if let Some(stage) = handle.stage() {
                if let Err(err) = stage.stop().await {
                    note_teardown_failure(name, "stop", DaqError::from_hardware(err), &mut failures);
                }
            }
            if let Err(err) = handle.device().disconnect().await {
                note_teardown_failure(
                    name,
                    "disconnect",
                    DaqError::from_hardware(err),
                    &mut failures,
                );
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(DaqError::ShutdownFailed(failures))
        }
    }
}

/// Record a teardown failure unless the device simply lacks the operation.
pub(crate) fn note_teardown_failure(
    instrument: &str,
    operation: &str,
    err: DaqError,
    failures: &mut Vec<DaqError>,
) {
    match err {
        DaqError::CapabilityMissing(_) => {
            debug!(instrument, operation, "not supported, skipped");
        }
        other => {
            warn!(instrument, operation, "teardown failed: {other}");
            failures.push(DaqError::Instrument(format!("{instrument}: {other}")));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::sink::SinkFile;
    use crate::experiment::plan::ParameterIteration;
    use crate::experiment::scan::GenericScan;
    use crate::hardware::mock::{DisconnectBehavior, MockCryostat};
    use crate::hardware::capabilities::Instrument;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    /// Records the applied coordinate at every hook call.
    struct Recorder {
        seen: Mutex<Vec<Vec<f64>>>,
        stop_after: Option<(usize, StopHandle)>,
    }

    #[async_trait]
    impl ScanType for Recorder {
        fn tag(&self) -> &'static str {
            "recorder"
        }

        fn required_roles(&self) -> Vec<crate::hardware::handle::InstrumentRole> {
            Vec::new()
        }

        fn steps_per_point(&self) -> usize {
            2
        }

        async fn measure(&self, ctx: &mut MeasureContext<'_>) -> AppResult<()> {
            let mut seen = self.seen.lock();
            seen.push(ctx.coordinate().iter().map(|c| c.value).collect());
            if let Some((n, stop)) = &self.stop_after {
                if seen.len() == *n {
                    stop.request_stop();
                }
            }
            ctx.step_completed();
            Ok(())
        }
    }

    fn sink() -> (tempfile::TempDir, SharedSink) {
        let dir = tempfile::tempdir().unwrap();
        let file = SinkFile::create(dir.path(), "w", false).unwrap();
        (dir, Arc::new(Mutex::new(file)))
    }

    fn plan(cryo: &Arc<MockCryostat>, outer: Vec<f64>, inner: Vec<f64>) -> SweepPlan {
        let handle = cryo.handle();
        let mut plan = SweepPlan::new();
        plan.push(ParameterIteration::bind("a", "K", "cryo", &handle, "set_temperature", outer).unwrap());
        plan.push(ParameterIteration::bind("b", "K", "cryo", &handle, "set_temperature", inner).unwrap());
        plan
    }

    #[tokio::test]
    async fn applies_only_changed_dimensions() {
        let cryo = Arc::new(MockCryostat::new());
        let (_dir, sink) = sink();
        let (events, _rx) = broadcast::channel(256);
        let scan = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
            stop_after: None,
        });
        let worker = SweepWorker::new(
            plan(&cryo, vec![1.0, 2.0], vec![10.0, 20.0, 30.0]),
            BTreeMap::new(),
            scan.clone(),
            sink,
            events,
            StopHandle::new(),
        );

        let outcome = worker.run().await.unwrap();
        assert_eq!(outcome.progress.current_step, 12);
        assert_eq!(outcome.progress.total_steps, 12);
        assert_eq!(outcome.tuples_completed, 6);
        // 2 outer + 6 inner applications
        assert_eq!(cryo.set_count(), 8);
        assert_eq!(
            cryo.setpoint_history(),
            vec![1.0, 10.0, 20.0, 30.0, 2.0, 10.0, 20.0, 30.0]
        );
        assert_eq!(scan.seen.lock()[3], vec![2.0, 10.0]);
    }

    #[tokio::test]
    async fn stop_is_honoured_at_next_tuple_boundary() {
        let cryo = Arc::new(MockCryostat::new());
        let (_dir, sink) = sink();
        let (events, _rx) = broadcast::channel(256);
        let stop = StopHandle::new();
        let scan = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
            stop_after: Some((2, stop.clone())),
        });
        let worker = SweepWorker::new(
            plan(&cryo, vec![1.0, 2.0], vec![10.0, 20.0, 30.0]),
            BTreeMap::new(),
            scan.clone(),
            sink,
            events,
            stop,
        );

        let outcome = worker.run().await.unwrap();
        assert_eq!(outcome.state, WorkerState::Complete);
        assert!(outcome.stopped_early);
        assert_eq!(scan.seen.lock().len(), 2);
    }

    #[tokio::test]
    async fn missing_hook_fails_the_sweep() {
        let (_dir, sink) = sink();
        let (events, mut rx) = broadcast::channel(64);
        let worker = SweepWorker::new(
            SweepPlan::new(),
            BTreeMap::new(),
            Arc::new(GenericScan),
            sink,
            events,
            StopHandle::new(),
        );
        let err = worker.run().await.unwrap_err();
        assert!(matches!(err, DaqError::MeasurementHookMissing(_)));

        let mut states = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let SweepEvent::StateChanged(state) = event {
                states.push(state);
            }
        }
        assert_eq!(states.last(), Some(&WorkerState::Failed));
        assert_eq!(states.first(), Some(&WorkerState::Loading));
    }

    #[tokio::test]
    async fn kill_disconnects_everything_and_collects_failures() {
        let broken = Arc::new(MockCryostat::new());
        broken.set_disconnect_behavior(DisconnectBehavior::Fail);
        let unsupported = Arc::new(MockCryostat::new());
        unsupported.set_disconnect_behavior(DisconnectBehavior::Unsupported);
        let fine = Arc::new(MockCryostat::new());
        fine.connect().await.unwrap();

        let stop = StopHandle::new();
        let kill = KillSwitch::new(
            vec![
                ("broken".into(), broken.handle()),
                ("unsupported".into(), unsupported.handle()),
                ("fine".into(), fine.handle()),
            ],
            stop.clone(),
        );
        let err = kill.kill().await.unwrap_err();
        assert!(stop.is_stop_requested());
        assert!(matches!(&err, DaqError::ShutdownFailed(failures) if failures.len() == 1));
        assert_eq!(fine.disconnect_attempts(), 1);
        assert!(!fine.is_connected());
    }
}
