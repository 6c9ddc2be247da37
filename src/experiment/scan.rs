//! Scan types: what happens at one coordinate tuple of a sweep.
//!
//! The sweep worker applies the coordinate's parameter values and then hands
//! control to [`ScanType::measure`]. A scan type declares which instrument
//! roles it needs and how many progress steps one call of its hook takes.

use crate::config::StepScanConfig;
use crate::data::sink::{Dataset, SinkFile};
use crate::error::{AppResult, DaqError};
use crate::experiment::state::{DataSample, ProgressState, SweepEvent};
use crate::hardware::handle::{InstrumentHandle, InstrumentRole};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Output sink shared between the coordinator and a running worker.
///
/// The lock is only ever held for synchronous tree edits, never across an
/// `.await`.
pub type SharedSink = Arc<Mutex<SinkFile>>;

/// Value of one sweep dimension at the current coordinate.
#[derive(Debug, Clone, PartialEq)]
pub struct CoordinateValue {
    /// Dimension name
    pub name: String,
    /// Dimension unit
    pub unit: String,
    /// Applied value
    pub value: f64,
}

/// Counts completed hook steps and publishes progress.
#[derive(Debug)]
pub struct ProgressTracker {
    state: ProgressState,
    events: broadcast::Sender<SweepEvent>,
}

impl ProgressTracker {
    /// Tracker starting at `state`
    pub fn new(state: ProgressState, events: broadcast::Sender<SweepEvent>) -> Self {
        Self { state, events }
    }

    /// Record one completed step and publish the new percentage.
    pub fn step_completed(&mut self) {
        self.advance_to(self.state.current_step + 1);
    }

    /// Move the counter forward to `step` (never backwards, never past the
    /// total).
    pub fn advance_to(&mut self, step: usize) {
        let step = step.min(self.state.total_steps);
        if step <= self.state.current_step {
            return;
        }
        self.state.current_step = step;
        let percentage = self.state.percentage();
        debug!(
            current = self.state.current_step,
            total = self.state.total_steps,
            "progress {percentage:.1}%"
        );
        let _ = self.events.send(SweepEvent::Progress {
            current: self.state.current_step,
            total: self.state.total_steps,
            percentage,
        });
    }

    /// Current counter
    pub fn state(&self) -> ProgressState {
        self.state
    }
}

/// Everything a measurement hook may touch for one coordinate tuple.
pub struct MeasureContext<'a> {
    coordinate: Vec<CoordinateValue>,
    group: String,
    instruments: &'a BTreeMap<String, InstrumentHandle>,
    sink: &'a SharedSink,
    progress: &'a mut ProgressTracker,
    events: &'a broadcast::Sender<SweepEvent>,
}

impl<'a> MeasureContext<'a> {
    /// Context for the tuple whose sink group is `group`.
    pub fn new(
        coordinate: Vec<CoordinateValue>,
        group: String,
        instruments: &'a BTreeMap<String, InstrumentHandle>,
        sink: &'a SharedSink,
        progress: &'a mut ProgressTracker,
        events: &'a broadcast::Sender<SweepEvent>,
    ) -> Self {
        Self {
            coordinate,
            group,
            instruments,
            sink,
            progress,
            events,
        }
    }

    /// Applied parameter values, outermost dimension first
    pub fn coordinate(&self) -> &[CoordinateValue] {
        &self.coordinate
    }

    /// Sink group of this tuple (`raw_data/<v1><u1> - <v2><u2>`)
    pub fn group_path(&self) -> &str {
        &self.group
    }

    /// First registered instrument able to fill `role`.
    pub fn instrument_with_role(&self, role: InstrumentRole) -> AppResult<&InstrumentHandle> {
        self.instruments
            .values()
            .find(|handle| handle.provides(role))
            .ok_or_else(|| DaqError::Requirement(vec![role.to_string()]))
    }

    /// Record one completed hook step
    pub fn step_completed(&mut self) {
        self.progress.step_completed();
    }

    /// Publish a measured point as `newData`
    pub fn emit_data(&self, sample: DataSample) {
        let _ = self.events.send(SweepEvent::NewData(sample));
    }

    /// Write datasets below `path` and flush the sink.
    pub fn write_datasets(
        &self,
        path: &str,
        datasets: Vec<(String, Dataset)>,
        attrs: Vec<(String, String)>,
    ) -> AppResult<()> {
        let mut sink = self.sink.lock();
        let root = sink.root_mut();
        for (name, dataset) in datasets {
            root.write_dataset(&format!("{path}/{name}"), dataset)?;
        }
        for (key, value) in attrs {
            root.set_attr(path, key, value);
        }
        sink.flush()
    }
}

/// Behaviour plugged into the sweep worker.
#[async_trait]
pub trait ScanType: Send + Sync {
    /// Tag stored in the sink metadata
    fn tag(&self) -> &'static str;

    /// Roles that must be provided by registered instruments
    fn required_roles(&self) -> Vec<InstrumentRole>;

    /// Progress steps taken by one call of [`ScanType::measure`]
    fn steps_per_point(&self) -> usize;

    /// Measure at the current coordinate tuple.
    async fn measure(&self, ctx: &mut MeasureContext<'_>) -> AppResult<()>;
}

/// Scan type without a measurement. Running it fails the sweep.
#[derive(Debug, Clone, Copy, Default)]
pub struct GenericScan;

#[async_trait]
impl ScanType for GenericScan {
    fn tag(&self) -> &'static str {
        "generic"
    }

    fn required_roles(&self) -> Vec<InstrumentRole> {
        Vec::new()
    }

    fn steps_per_point(&self) -> usize {
        1
    }

    async fn measure(&self, _ctx: &mut MeasureContext<'_>) -> AppResult<()> {
        Err(DaqError::MeasurementHookMissing(self.tag().to_string()))
    }
}

/// Delay scan: step a stage through a position list and read lock-in
/// channels at every position, once per average.
#[derive(Debug)]
pub struct StepScan {
    settings: RwLock<StepScanConfig>,
}

impl StepScan {
    /// Scan with validated settings
    pub fn new(settings: StepScanConfig) -> AppResult<Self> {
        settings.validate()?;
        Ok(Self {
            settings: RwLock::new(settings),
        })
    }

    /// Current settings
    pub fn settings(&self) -> StepScanConfig {
        self.settings.read().clone()
    }

    /// Replace all settings at once. Nothing changes if validation fails.
    pub fn set_settings(&self, settings: StepScanConfig) -> AppResult<()> {
        settings.validate()?;
        *self.settings.write() = settings;
        Ok(())
    }

    async fn measure_average(
        &self,
        ctx: &mut MeasureContext<'_>,
        average: usize,
        settings: &StepScanConfig,
        stage: &InstrumentHandle,
        lockin: &InstrumentHandle,
    ) -> AppResult<()> {
        let movable = stage
            .stage()
            .ok_or_else(|| DaqError::Requirement(vec![InstrumentRole::DelayStage.to_string()]))?;
        let reader = lockin
            .reader()
            .ok_or_else(|| DaqError::Requirement(vec![InstrumentRole::LockIn.to_string()]))?;

        let n = settings.stage_positions.len();
        let mut positions = Vec::with_capacity(n);
        let mut real_positions = Vec::with_capacity(n);
        let mut columns: BTreeMap<String, Vec<f64>> = settings
            .channels
            .iter()
            .map(|ch| (ch.clone(), Vec::with_capacity(n)))
            .collect();

        for &nominal in &settings.stage_positions {
            let target = nominal + settings.time_zero;
            movable.move_abs(target).await.map_err(DaqError::from_hardware)?;

            let real = match movable.position().await {
                Ok(position) => position,
                Err(err) => {
                    warn!(
                        target,
                        "no stage readback ({}), storing nominal position",
                        DaqError::from_hardware(err)
                    );
                    target
                }
            };

            let values = reader
                .read_channels(&settings.channels)
                .await
                .map_err(DaqError::from_hardware)?;
            for (channel, column) in columns.iter_mut() {
                let value = values.get(channel).copied().ok_or_else(|| {
                    DaqError::Instrument(format!("lock-in returned no value for '{channel}'"))
                })?;
                column.push(value);
            }
            debug!(target, real, ?values, "measured");

            positions.push(target);
            real_positions.push(real);
            ctx.emit_data(DataSample {
                group: ctx.group_path().to_string(),
                average,
                position: target,
                real_position: real,
                values,
            });
            ctx.step_completed();
        }

        let path = format!("{}/avg{:04}", ctx.group_path(), average);
        let mut datasets = vec![
            ("pos".to_string(), Dataset::vector(positions)),
            ("real_pos".to_string(), Dataset::vector(real_positions)),
        ];
        datasets.extend(
            columns
                .into_iter()
                .map(|(channel, column)| (channel, Dataset::vector(column))),
        );
        ctx.write_datasets(&path, datasets, vec![("index".into(), "pos".into())])?;
        debug!(path, "average written");
        Ok(())
    }
}

#[async_trait]
impl ScanType for StepScan {
    fn tag(&self) -> &'static str {
        "stepscan"
    }

    fn required_roles(&self) -> Vec<InstrumentRole> {
        vec![InstrumentRole::DelayStage, InstrumentRole::LockIn]
    }

    fn steps_per_point(&self) -> usize {
        let settings = self.settings.read();
        settings.stage_positions.len() * settings.averages
    }

    async fn measure(&self, ctx: &mut MeasureContext<'_>) -> AppResult<()> {
        let settings = self.settings();
        let stage = ctx.instrument_with_role(InstrumentRole::DelayStage)?.clone();
        let lockin = ctx.instrument_with_role(InstrumentRole::LockIn)?.clone();
        info!(group = ctx.group_path(), averages = settings.averages, "step scan started");

        for average in 0..settings.averages {
            lockin
                .device()
                .connect()
                .await
                .map_err(DaqError::from_hardware)?;
            debug!(average, "scanning average");

            let measured = self
                .measure_average(ctx, average, &settings, &stage, &lockin)
                .await;
            let released = lockin.device().disconnect().await;
            measured?;
            if let Err(err) = released {
                match DaqError::from_hardware(err) {
                    DaqError::CapabilityMissing(_) => {}
                    other => return Err(other),
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::{MockLockIn, MockStage};
    use tracing_test::traced_test;

    fn settings(positions: Vec<f64>, averages: usize) -> StepScanConfig {
        StepScanConfig {
            averages,
            stage_positions: positions,
            time_zero: 1.0,
            channels: vec!["X".into(), "Y".into()],
        }
    }

    #[test]
    fn steps_per_point_is_positions_times_averages() {
        let scan = StepScan::new(settings(vec![0.0, 1.0, 2.0], 4)).unwrap();
        assert_eq!(scan.steps_per_point(), 12);
        assert_eq!(scan.tag(), "stepscan");
    }

    #[test]
    fn invalid_settings_leave_previous_in_place() {
        let scan = StepScan::new(settings(vec![0.0, 1.0], 2)).unwrap();
        assert!(scan.set_settings(settings(vec![1.0, 0.5], 2)).is_err());
        assert!(scan.set_settings(settings(vec![0.0, 1.0], 0)).is_err());
        assert_eq!(scan.settings().stage_positions, vec![0.0, 1.0]);
        assert_eq!(scan.settings().averages, 2);
    }

    #[tokio::test]
    async fn step_scan_writes_one_table_per_average() {
        let dir = tempfile::tempdir().unwrap();
        let sink: SharedSink = Arc::new(Mutex::new(SinkFile::create(dir.path(), "t", false).unwrap()));
        let stage = Arc::new(MockStage::with_speed(1e9));
        let lockin = Arc::new(MockLockIn::new());
        let instruments = BTreeMap::from([
            ("delay_stage".to_string(), stage.handle()),
            ("lockin".to_string(), lockin.handle()),
        ]);
        let (events, mut rx) = broadcast::channel(64);
        let scan = StepScan::new(settings(vec![0.0, 0.5, 1.0], 2)).unwrap();
        let mut tracker = ProgressTracker::new(
            ProgressState {
                current_step: 0,
                total_steps: scan.steps_per_point(),
            },
            events.clone(),
        );

        let mut ctx = MeasureContext::new(
            Vec::new(),
            "raw_data".into(),
            &instruments,
            &sink,
            &mut tracker,
            &events,
        );
        scan.measure(&mut ctx).await.unwrap();

        assert_eq!(tracker.state().current_step, 6);
        assert_eq!(lockin.connect_count(), 2);
        assert!(!lockin.is_connected());

        let sink = sink.lock();
        let table = sink.root().group("raw_data/avg0001").unwrap();
        assert_eq!(table.datasets["pos"].data, vec![1.0, 1.5, 2.0]);
        assert_eq!(table.datasets["real_pos"].data, vec![1.0, 1.5, 2.0]);
        assert_eq!(table.datasets["X"].data, vec![4.0, 5.0, 6.0]);
        assert!(sink.root().group("raw_data/avg0000").is_some());

        let mut new_data = 0;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, SweepEvent::NewData(_)) {
                new_data += 1;
            }
        }
        assert_eq!(new_data, 6);
    }

    #[tokio::test]
    #[traced_test]
    async fn missing_readback_stores_nominal_position() {
        let dir = tempfile::tempdir().unwrap();
        let sink: SharedSink = Arc::new(Mutex::new(SinkFile::create(dir.path(), "r", false).unwrap()));
        let stage = Arc::new(MockStage::with_speed(1e9));
        stage.set_readback_available(false);
        let lockin = Arc::new(MockLockIn::new());
        let instruments = BTreeMap::from([
            ("delay_stage".to_string(), stage.handle()),
            ("lockin".to_string(), lockin.handle()),
        ]);
        let (events, _rx) = broadcast::channel(64);
        let scan = StepScan::new(settings(vec![0.0, 2.0], 1)).unwrap();
        let mut tracker = ProgressTracker::new(
            ProgressState {
                current_step: 0,
                total_steps: scan.steps_per_point(),
            },
            events.clone(),
        );
        let mut ctx = MeasureContext::new(
            Vec::new(),
            "raw_data".into(),
            &instruments,
            &sink,
            &mut tracker,
            &events,
        );
        scan.measure(&mut ctx).await.unwrap();

        let sink = sink.lock();
        let table = sink.root().group("raw_data/avg0000").unwrap();
        assert_eq!(table.datasets["real_pos"].data, vec![1.0, 3.0]);
        assert!(logs_contain("no stage readback"));
    }

    #[tokio::test]
    async fn generic_scan_has_no_hook() {
        let dir = tempfile::tempdir().unwrap();
        let sink: SharedSink = Arc::new(Mutex::new(SinkFile::create(dir.path(), "g", false).unwrap()));
        let instruments = BTreeMap::new();
        let (events, _rx) = broadcast::channel(4);
        let mut tracker = ProgressTracker::new(
            ProgressState {
                current_step: 0,
                total_steps: 1,
            },
            events.clone(),
        );
        let mut ctx = MeasureContext::new(
            Vec::new(),
            "raw_data".into(),
            &instruments,
            &sink,
            &mut tracker,
            &events,
        );
        let err = GenericScan.measure(&mut ctx).await.unwrap_err();
        assert!(matches!(err, DaqError::MeasurementHookMissing(tag) if tag == "generic"));
    }
}
