//! Experiment coordinator: instrument registry, sweep plan and output sink.
//!
//! The coordinator owns everything a sweep needs and hands clones to a
//! [`SweepWorker`] running on its own tokio task. `start_measurement` awaits
//! that task, so callers resume once the sweep has reached a terminal state.
//!
//! # Example
//!
//! ```rust,ignore
//! let mut coordinator = ExperimentCoordinator::new(Arc::new(StepScan::new(cfg)?), arbiter);
//! coordinator.add_instrument("delay_stage", stage.handle())?;
//! coordinator.add_instrument("lockin", lockin.handle())?;
//! coordinator.add_instrument("cryo", cryo.handle())?;
//! coordinator.add_parameter_iteration("temperature", "K", "cryo", "set_temperature", vec![10.0, 20.0])?;
//! coordinator.create_file("run1", "data", false).await?;
//! let outcome = coordinator.start_measurement().await?;
//! ```

use crate::data::sink::{Dataset, SinkFile};
use crate::error::{AppResult, DaqError};
use crate::experiment::plan::{ParameterIteration, SweepPlan};
use crate::experiment::scan::{ScanType, SharedSink};
use crate::experiment::state::{ProgressState, StopHandle, SweepEvent, SweepOutcome};
use crate::experiment::worker::{note_teardown_failure, KillSwitch, SweepWorker};
use crate::hardware::arbiter::{HardwareArbiter, HardwareOwner};
use crate::hardware::capabilities::ParameterSnapshot;
use crate::hardware::handle::InstrumentHandle;
use chrono::Local;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

const EVENT_CAPACITY: usize = 1024;

/// Builds and runs parameter sweeps.
pub struct ExperimentCoordinator {
    name: String,
    instruments: BTreeMap<String, InstrumentHandle>,
    plan: SweepPlan,
    scan: Arc<dyn ScanType>,
    sink: Option<SharedSink>,
    arbiter: HardwareArbiter,
    events: broadcast::Sender<SweepEvent>,
    stop: StopHandle,
}

impl ExperimentCoordinator {
    /// Coordinator for `scan`, sharing hardware through `arbiter`.
    pub fn new(scan: Arc<dyn ScanType>, arbiter: HardwareArbiter) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            name: format!(
                "unknown measurement {}",
                Local::now().format("%Y-%m-%d %H:%M:%S")
            ),
            instruments: BTreeMap::new(),
            plan: SweepPlan::new(),
            scan,
            sink: None,
            arbiter,
            events,
            stop: StopHandle::new(),
        }
    }

    /// Measurement name written to the sink metadata
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Rename the measurement
    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    /// The scan type
    pub fn scan(&self) -> &Arc<dyn ScanType> {
        &self.scan
    }

    /// The sweep plan
    pub fn plan(&self) -> &SweepPlan {
        &self.plan
    }

    /// Current output sink, if one was created
    pub fn sink(&self) -> Option<&SharedSink> {
        self.sink.as_ref()
    }

    /// Register a device under `name`.
    ///
    /// The handle must expose at least one named setter. Re-registering a
    /// name replaces the previous handle.
    pub fn add_instrument(&mut self, name: impl Into<String>, handle: InstrumentHandle) -> AppResult<()> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(DaqError::Validation("instrument name is empty".into()));
        }
        if handle.setter_names().is_empty() {
            return Err(DaqError::Validation(format!(
                "instrument '{name}' exposes no setters"
            )));
        }
        if self.instruments.insert(name.clone(), handle).is_some() {
            warn!(instrument = %name, "instrument replaced");
        } else {
            debug!(instrument = %name, "instrument registered");
        }
        Ok(())
    }

    /// Drop every registered instrument and the sweep plan built on them
    pub fn clear_instruments(&mut self) {
        self.instruments.clear();
        self.plan.clear();
    }

    /// Registered instrument names, sorted
    pub fn instrument_names(&self) -> Vec<&str> {
        self.instruments.keys().map(String::as_str).collect()
    }

    /// Registered handle by name
    pub fn instrument(&self, name: &str) -> Option<&InstrumentHandle> {
        self.instruments.get(name)
    }

    /// Append a sweep dimension driving `method` on `instrument`.
    ///
    /// The setter is resolved now; nothing is looked up by name while the
    /// sweep runs.
    pub fn add_parameter_iteration(
        &mut self,
        name: impl Into<String>,
        unit: impl Into<String>,
        instrument: &str,
        method: &str,
        values: Vec<f64>,
    ) -> AppResult<()> {
        let handle = self.instruments.get(instrument).ok_or_else(|| {
            DaqError::Validation(format!("no instrument registered as '{instrument}'"))
        })?;
        let dimension = ParameterIteration::bind(name, unit, instrument, handle, method, values)?;
        info!(
            name = %dimension.name,
            instrument,
            method,
            values = dimension.len(),
            "sweep dimension added"
        );
        self.plan.push(dimension);
        Ok(())
    }

    /// Fail with `Requirement` naming every missing role, and the output
    /// sink if none was created.
    pub fn check_requirements(&self) -> AppResult<()> {
        let mut missing: Vec<String> = self
            .scan
            .required_roles()
            .into_iter()
            .filter(|role| !self.instruments.values().any(|h| h.provides(*role)))
            .map(|role| role.to_string())
            .collect();
        if self.sink.is_none() {
            missing.push("output sink".to_string());
        }
        if missing.is_empty() {
            Ok(())
        } else {
            Err(DaqError::Requirement(missing))
        }
    }

    /// Create the output sink `name` in `dir` and lay out its regions.
    ///
    /// `settings` gets one group per instrument holding its current
    /// parameters, `axes` one dataset per sweep dimension.
    pub async fn create_file(
        &mut self,
        name: &str,
        dir: impl AsRef<Path>,
        replace: bool,
    ) -> AppResult<PathBuf> {
        let mut snapshots = BTreeMap::new();
        for (instrument, handle) in &self.instruments {
            let snapshot = handle
                .device()
                .snapshot()
                .await
                .map_err(DaqError::from_hardware)?;
            snapshots.insert(instrument.clone(), snapshot);
        }

        let mut sink = SinkFile::create(dir, name, replace)?;
        let root = sink.root_mut();
        root.require_group("raw_data");
        root.require_group("settings");
        for (instrument, snapshot) in snapshots {
            let group = root.require_group(&format!("settings/{instrument}"));
            group.attrs.extend(snapshot);
        }
        root.require_group("axes");
        for dim in self.plan.dimensions() {
            root.write_dataset(
                &format!("axes/{}", dim.name),
                Dataset::vector(dim.values.clone())
                    .with_attr("unit", dim.unit.as_str())
                    .with_attr("instrument", dim.instrument.as_str())
                    .with_attr("method", dim.method.as_str()),
            )?;
        }
        root.set_attr("metadata", "date", Local::now().to_rfc3339());
        root.set_attr("metadata", "type", self.scan.tag());
        root.set_attr("metadata", "name", self.name.as_str());
        sink.flush()?;

        let path = sink.path().to_path_buf();
        info!(path = %path.display(), "output sink created");
        self.sink = Some(Arc::new(Mutex::new(sink)));
        Ok(path)
    }

    /// Read the `settings` region of an existing sink back into
    /// per-instrument snapshots.
    pub fn load_settings(path: impl AsRef<Path>) -> AppResult<BTreeMap<String, ParameterSnapshot>> {
        let sink = SinkFile::open(path)?;
        let settings = sink.root().group("settings").ok_or_else(|| {
            DaqError::Validation(format!("{} has no settings region", sink.path().display()))
        })?;
        Ok(settings
            .groups
            .iter()
            .map(|(name, group)| (name.clone(), group.attrs.clone()))
            .collect())
    }

    /// Subscribe to sweep lifecycle events
    pub fn subscribe(&self) -> broadcast::Receiver<SweepEvent> {
        self.events.subscribe()
    }

    /// Cooperative stop flag of this coordinator's sweeps
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Hard stop over the currently registered instruments
    pub fn kill_switch(&self) -> KillSwitch {
        KillSwitch::new(
            self.instruments
                .iter()
                .map(|(name, handle)| (name.clone(), handle.clone()))
                .collect(),
            self.stop.clone(),
        )
    }

    /// Run the sweep and wait for it to finish.
    ///
    /// Requirements are checked and the hardware is claimed before any
    /// device is touched. The sweep runs on its own task; this returns when
    /// it completes, is stopped or fails.
    ///
    /// The hardware guard belongs to the sweep task, not to this future.
    /// Dropping the returned future detaches the sweep; the hardware stays
    /// claimed until the sweep reaches a terminal state. Use the stop handle
    /// or the kill switch to end it early.
    pub async fn start_measurement(&self) -> AppResult<SweepOutcome> {
        self.check_requirements()?;
        let sink = self
            .sink
            .clone()
            .ok_or_else(|| DaqError::Requirement(vec!["output sink".into()]))?;
        let guard = self.arbiter.try_acquire(HardwareOwner::Sweep)?;
        self.stop.reset();

        let worker = SweepWorker::new(
            self.plan.clone(),
            self.instruments.clone(),
            self.scan.clone(),
            sink.clone(),
            self.events.clone(),
            self.stop.clone(),
        );
        info!(name = %self.name, run_id = worker.run_id(), "starting measurement");

        let task = tokio::spawn(async move {
            let result = worker.run().await;
            if let Err(err) = sink.lock().flush() {
                warn!("final sink flush failed: {err}");
            }
            drop(guard);
            result
        });
        task.await
            .map_err(|e| DaqError::Processing(format!("sweep task aborted: {e}")))?
    }

    /// Connect every instrument. All are attempted; failures are returned
    /// together.
    pub async fn connect_all(&self) -> AppResult<()> {
        let mut failures = Vec::new();
        for (name, handle) in &self.instruments {
            if let Err(err) = handle.device().connect().await {
                let err = DaqError::from_hardware(err);
                warn!(instrument = %name, "connect failed: {err}");
                failures.push(DaqError::Instrument(format!("{name}: {err}")));
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(DaqError::ShutdownFailed(failures))
        }
    }

    /// Disconnect every instrument. All are attempted; devices without a
    /// disconnect are skipped.
    pub async fn disconnect_all(&self) -> AppResult<()> {
        let mut failures = Vec::new();
        for (name, handle) in &self.instruments {
            if let Err(err) = handle.device().disconnect().await {
                note_teardown_failure(name, "disconnect", DaqError::from_hardware(err), &mut failures);
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(DaqError::ShutdownFailed(failures))
        }
    }

    /// Printable summary of instruments, dimensions and step counts
    pub fn describe_setup(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Measurement: {}", self.name);
        let _ = writeln!(out, "Scan type: {}", self.scan.tag());
        let _ = writeln!(out, "Instruments:");
        for (name, handle) in &self.instruments {
            let roles: Vec<String> = handle.roles().iter().map(ToString::to_string).collect();
            let _ = writeln!(
                out,
                "  {name}: setters [{}] roles [{}]",
                handle.setter_names().join(", "),
                roles.join(", ")
            );
        }
        let _ = writeln!(out, "Sweep dimensions:");
        let _ = write!(out, "{}", self.plan);
        let progress = ProgressState::for_plan(&self.plan, self.scan.steps_per_point());
        let _ = writeln!(
            out,
            "Coordinate tuples: {}, total steps: {}",
            self.plan.tuple_count(),
            progress.total_steps
        );
        match &self.sink {
            Some(sink) => {
                let _ = writeln!(out, "Output: {}", sink.lock().path().display());
            }
            None => {
                let _ = writeln!(out, "Output: (none)");
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::scan::GenericScan;
    use crate::hardware::mock::{MockCryostat, MockStage};

    fn coordinator() -> ExperimentCoordinator {
        ExperimentCoordinator::new(Arc::new(GenericScan), HardwareArbiter::new())
    }

    #[test]
    fn default_name_marks_unknown_measurement() {
        let mut c = coordinator();
        assert!(c.name().starts_with("unknown measurement "));
        c.set_name("dyes");
        assert_eq!(c.name(), "dyes");
    }

    #[test]
    fn parameter_iteration_needs_registered_instrument() {
        let mut c = coordinator();
        let err = c
            .add_parameter_iteration("T", "K", "cryo", "set_temperature", vec![1.0])
            .unwrap_err();
        assert!(matches!(err, DaqError::Validation(_)));

        c.add_instrument("cryo", Arc::new(MockCryostat::new()).handle()).unwrap();
        c.add_parameter_iteration("T", "K", "cryo", "set_temperature", vec![1.0, 2.0])
            .unwrap();
        assert!(c
            .add_parameter_iteration("T", "K", "cryo", "set_pressure", vec![1.0])
            .is_err());
        assert_eq!(c.plan().dimensions().len(), 1);
    }

    #[test]
    fn missing_sink_is_a_requirement() {
        let c = coordinator();
        let err = c.check_requirements().unwrap_err();
        assert_eq!(err.to_string(), "Requirements not met: output sink");
    }

    #[tokio::test]
    async fn sweep_is_rejected_while_hardware_is_busy() {
        let arbiter = HardwareArbiter::new();
        let mut c = ExperimentCoordinator::new(Arc::new(GenericScan), arbiter.clone());
        let dir = tempfile::tempdir().unwrap();
        c.create_file("busy", dir.path(), false).await.unwrap();

        let _streaming = arbiter.try_acquire(HardwareOwner::Streaming).unwrap();
        let err = c.start_measurement().await.unwrap_err();
        assert!(matches!(err, DaqError::ResourceBusy(_)));
    }

    #[tokio::test]
    async fn describe_setup_lists_instruments() {
        let mut c = coordinator();
        c.add_instrument("delay_stage", Arc::new(MockStage::new()).handle())
            .unwrap();
        let text = c.describe_setup();
        assert!(text.contains("delay_stage: setters [move_absolute] roles [delay_stage]"));
        assert!(text.contains("total steps: 1"));
    }
}
