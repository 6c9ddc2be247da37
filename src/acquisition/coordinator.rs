//! Streaming acquisition coordinator.
//!
//! # Pipeline
//!
//! ```text
//! FrameSource ─> StreamProducer ─try_send─> bounded queue ─> ProcessingWorkerPool
//!                      │                                          │ project
//!                      └─> raw average                            v
//!                                             Aggregator (single writer, reorder)
//!                                                                 │ running average
//!                                                                 └─> optional Fit job
//! ```
//!
//! Every stage publishes [`StreamEvent`]s on a broadcast channel. The
//! producer never waits for processing: when the queue is full the frame is
//! dropped and counted. Stopping is two-phase: `stop_streamer` only signals,
//! the next lifecycle tick joins the producer, drains the pool and releases
//! the hardware.

use crate::acquisition::aggregator::Aggregator;
use crate::acquisition::pool::{Job, JobHandler, JobSubmitter, ProcessingWorkerPool};
use crate::acquisition::producer::{ProducerSettings, SharedSource, StreamProducer};
use crate::config::{validate_n_processors, validate_shaker_gain, CalibrationConfig, FastScanConfig};
use crate::data::fit::{fit_autocorrelation, PeakFit};
use crate::data::processor::{project, ProcessedCurve, ProjectionParams, RawAverage, StreamFrame};
use crate::data::sink::{Dataset, SinkFile, SinkValue};
use crate::error::{AppResult, DaqError};
use crate::hardware::arbiter::{HardwareArbiter, HardwareGuard, HardwareOwner};
use crate::hardware::capabilities::Movable;
use crate::procedures::shaker_calibration::{self, CalibrationResult};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

const EVENT_CAPACITY: usize = 256;

/// Notifications published by the streaming pipeline.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// A raw frame was queued for processing
    RawFrame {
        /// Sequence number assigned at queueing
        seq: u64,
        /// Number of values in the frame
        len: usize,
    },
    /// The raw average absorbed another frame
    RawAverage {
        /// Frames averaged so far
        count: usize,
    },
    /// A frame was projected
    ProcessedCurve(Arc<ProcessedCurve>),
    /// The running average changed
    Average(Arc<ProcessedCurve>),
    /// A peak fit of the running average finished
    FitResult {
        /// Sequence number of the newest curve in the fitted average
        seq: u64,
        /// Fit parameters
        fit: PeakFit,
    },
    /// Recoverable pipeline error (failed projection, fit, acquisition)
    Error(String),
    /// Teardown finished; the hardware is free again
    Stopped,
}

struct Session {
    producer: StreamProducer,
    pool: ProcessingWorkerPool,
    guard: HardwareGuard,
}

struct Shared {
    settings: RwLock<FastScanConfig>,
    aggregator: Mutex<Aggregator>,
    raw: Mutex<RawAverage>,
    events: broadcast::Sender<StreamEvent>,
    dropped: AtomicU64,
    session: Mutex<Option<Session>>,
    should_stop: AtomicBool,
}

impl Shared {
    fn emit(&self, event: StreamEvent) {
        let _ = self.events.send(event);
    }

    fn process_frame(&self, frame: StreamFrame, params: &ProjectionParams, submitter: &JobSubmitter) {
        let curve = match project(&frame, params) {
            Ok(curve) => {
                self.emit(StreamEvent::ProcessedCurve(Arc::new(curve.clone())));
                Some(curve)
            }
            Err(err) => {
                warn!(seq = frame.seq, "projection failed: {err}");
                self.emit(StreamEvent::Error(err.to_string()));
                None
            }
        };

        let fit = self.settings.read().fit_autocorrelation;
        // Held while emitting so averages go out in the order they were made.
        let mut aggregator = self.aggregator.lock();
        for average in aggregator.submit(frame.seq, curve) {
            if fit && submitter.try_submit(Job::Fit(average.clone())).is_err() {
                debug!(seq = average.seq, "queue full, fit skipped");
            }
            self.emit(StreamEvent::Average(Arc::new(average)));
        }
    }

    fn fit(&self, curve: ProcessedCurve) {
        let expected = self.settings.read().expected_pulse_duration;
        match fit_autocorrelation(&curve, expected) {
            Ok(fit) => {
                debug!(seq = curve.seq, center = fit.center, fwhm = fit.fwhm, "fit");
                self.emit(StreamEvent::FitResult { seq: curve.seq, fit });
            }
            Err(err) => {
                if err.is_recoverable() {
                    warn!(seq = curve.seq, "autocorrelation fit: {err}");
                } else {
                    error!(seq = curve.seq, "autocorrelation fit: {err}");
                }
                self.emit(StreamEvent::Error(err.to_string()));
            }
        }
    }

    /// Deferred teardown: runs on the tick once a stop was requested or the
    /// producer ended by itself.
    fn on_tick(&self) {
        let session = {
            let mut slot = self.session.lock();
            let producer_done = slot.as_ref().is_some_and(|s| s.producer.is_finished());
            if !(self.should_stop.load(Ordering::SeqCst) || producer_done) {
                return;
            }
            self.should_stop.store(false, Ordering::SeqCst);
            slot.take()
        };
        if let Some(session) = session {
            self.teardown(session);
        }
    }

    fn teardown(&self, session: Session) {
        let Session {
            producer,
            pool,
            guard,
        } = session;
        let frames = producer.frame_count();
        producer.join();
        pool.shutdown();
        drop(guard);
        info!(
            frames,
            dropped = self.dropped.load(Ordering::Relaxed),
            "streamer stopped"
        );
        self.emit(StreamEvent::Stopped);
    }
}

/// Owns the streaming pipeline, the running average and the calibration
/// routine.
pub struct AcquisitionCoordinator {
    shared: Arc<Shared>,
    source: SharedSource,
    stage: Arc<dyn Movable>,
    arbiter: HardwareArbiter,
    ticking: Arc<AtomicBool>,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl AcquisitionCoordinator {
    /// Coordinator over `source` and `stage`; starts the lifecycle tick.
    pub fn new(
        settings: FastScanConfig,
        source: SharedSource,
        stage: Arc<dyn Movable>,
        arbiter: HardwareArbiter,
    ) -> AppResult<Self> {
        settings.validate()?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let tick = Duration::from_millis(settings.tick_interval_ms);
        let shared = Arc::new(Shared {
            aggregator: Mutex::new(Aggregator::new(settings.n_averages, settings.reorder_frames)),
            settings: RwLock::new(settings),
            raw: Mutex::new(RawAverage::default()),
            events,
            dropped: AtomicU64::new(0),
            session: Mutex::new(None),
            should_stop: AtomicBool::new(false),
        });

        let ticking = Arc::new(AtomicBool::new(true));
        let ticker = {
            let shared = shared.clone();
            let ticking = ticking.clone();
            thread::Builder::new()
                .name("femtoscan-tick".into())
                .spawn(move || {
                    while ticking.load(Ordering::SeqCst) {
                        thread::sleep(tick);
                        shared.on_tick();
                    }
                })?
        };

        Ok(Self {
            shared,
            source,
            stage,
            arbiter,
            ticking,
            ticker: Mutex::new(Some(ticker)),
        })
    }

    /// Subscribe to pipeline events
    pub fn subscribe(&self) -> broadcast::Receiver<StreamEvent> {
        self.shared.events.subscribe()
    }

    /// Current settings
    pub fn settings(&self) -> FastScanConfig {
        self.shared.settings.read().clone()
    }

    /// Whether a streaming session exists (including one waiting for teardown)
    pub fn is_streaming(&self) -> bool {
        self.shared.session.lock().is_some()
    }

    /// Start continuous acquisition with the current settings.
    ///
    /// Fails with `ResourceBusy` while the hardware is held elsewhere or the
    /// previous session has not been torn down yet.
    pub fn start_streamer(&self) -> AppResult<()> {
        if !self.ticking.load(Ordering::SeqCst) {
            return Err(DaqError::Validation("acquisition coordinator is closed".into()));
        }
        let mut slot = self.shared.session.lock();
        if slot.is_some() {
            let reason = if self.shared.should_stop.load(Ordering::SeqCst) {
                "previous stream is still shutting down"
            } else {
                "already streaming"
            };
            return Err(DaqError::ResourceBusy(reason.into()));
        }

        let settings = self.settings();
        settings.validate()?;
        let guard = self.arbiter.try_acquire(HardwareOwner::Streaming)?;
        self.shared.should_stop.store(false, Ordering::SeqCst);
        {
            let mut aggregator = self.shared.aggregator.lock();
            aggregator.set_reorder(settings.reorder_frames);
            aggregator.set_window(settings.n_averages);
            aggregator.restart_sequence();
        }

        let params = ProjectionParams {
            dark_control: settings.dark_control,
            position_step: settings.shaker_position_step,
            time_step: settings.shaker_ps_per_step,
        };
        let handler: JobHandler = {
            let shared = self.shared.clone();
            Arc::new(move |job: Job, submitter: &JobSubmitter| match job {
                Job::Project(frame) => shared.process_frame(frame, &params, submitter),
                Job::Fit(curve) => shared.fit(curve),
            })
        };
        let pool = ProcessingWorkerPool::new(settings.n_processors, settings.queue_capacity, handler)?;

        let on_frame = {
            let shared = self.shared.clone();
            let submitter = pool.submitter();
            let mut next_seq = 0_u64;
            move |samples: Vec<f64>| {
                let count = {
                    let mut raw = shared.raw.lock();
                    raw.update(&samples);
                    raw.count()
                };
                shared.emit(StreamEvent::RawAverage { count });

                let len = samples.len();
                let frame = StreamFrame {
                    seq: next_seq,
                    samples,
                };
                match submitter.try_submit(Job::Project(frame)) {
                    Ok(()) => {
                        shared.emit(StreamEvent::RawFrame { seq: next_seq, len });
                        next_seq += 1;
                    }
                    Err(_) => {
                        let dropped = shared.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                        warn!(dropped, "frame queue full, frame dropped");
                    }
                }
            }
        };
        let on_error = {
            let shared = self.shared.clone();
            move |err: DaqError| shared.emit(StreamEvent::Error(err.to_string()))
        };
        let producer = StreamProducer::start(
            self.source.clone(),
            ProducerSettings {
                n_samples: settings.n_samples,
                dark_control: settings.dark_control,
            },
            on_frame,
            on_error,
        )?;

        *slot = Some(Session {
            producer,
            pool,
            guard,
        });
        info!(
            n_processors = settings.n_processors,
            n_samples = settings.n_samples,
            dark_control = settings.dark_control,
            "streamer started"
        );
        debug!(?settings, "streamer settings");
        Ok(())
    }

    /// Signal the producer to stop. Teardown happens on the next tick.
    pub fn stop_streamer(&self) {
        if let Some(session) = self.shared.session.lock().as_ref() {
            debug!("streamer stopping");
            session.producer.signal_stop();
            self.shared.should_stop.store(true, Ordering::SeqCst);
        }
    }

    /// Change the averaging window; the average is recomputed immediately.
    pub fn set_n_averages(&self, n_averages: usize) -> AppResult<()> {
        if n_averages == 0 {
            return Err(DaqError::Validation("n_averages must be at least 1".into()));
        }
        self.shared.settings.write().n_averages = n_averages;
        let mut aggregator = self.shared.aggregator.lock();
        if let Some(average) = aggregator.set_window(n_averages) {
            self.shared.emit(StreamEvent::Average(Arc::new(average)));
        }
        debug!(n_averages, "n_averages set");
        Ok(())
    }

    /// Dark control; applies from the next `start_streamer`
    pub fn set_dark_control(&self, dark_control: bool) {
        self.shared.settings.write().dark_control = dark_control;
    }

    /// Samples per frame; applies from the next `start_streamer`
    pub fn set_n_samples(&self, n_samples: usize) -> AppResult<()> {
        if n_samples == 0 {
            return Err(DaqError::Validation("n_samples must be positive".into()));
        }
        self.shared.settings.write().n_samples = n_samples;
        Ok(())
    }

    /// Shaker amplifier gain (1, 10 or 100)
    pub fn set_shaker_gain(&self, gain: u32) -> AppResult<()> {
        validate_shaker_gain(gain)?;
        self.shared.settings.write().shaker_gain = gain;
        Ok(())
    }

    /// Pool size; applies from the next `start_streamer`
    pub fn set_n_processors(&self, n_processors: usize) -> AppResult<()> {
        validate_n_processors(n_processors)?;
        self.shared.settings.write().n_processors = n_processors;
        Ok(())
    }

    /// Fit every new running average; takes effect immediately
    pub fn set_fit_autocorrelation(&self, enabled: bool) {
        self.shared.settings.write().fit_autocorrelation = enabled;
    }

    /// Delay per shaker step, e.g. from a calibration; applies from the next
    /// `start_streamer`
    pub fn set_shaker_ps_per_step(&self, ps_per_step: f64) -> AppResult<()> {
        if !(ps_per_step.is_finite() && ps_per_step > 0.0) {
            return Err(DaqError::Validation(format!(
                "shaker_ps_per_step must be positive, got {ps_per_step}"
            )));
        }
        self.shared.settings.write().shaker_ps_per_step = ps_per_step;
        Ok(())
    }

    /// Replace all settings at once (validated first). The averaging window
    /// changes immediately, everything else at the next `start_streamer`.
    pub fn apply_settings(&self, settings: FastScanConfig) -> AppResult<()> {
        settings.validate()?;
        let n_averages = settings.n_averages;
        *self.shared.settings.write() = settings;
        self.set_n_averages(n_averages)
    }

    /// Clear curve history, running average and raw average
    pub fn reset_data(&self) {
        self.shared.aggregator.lock().clear();
        self.shared.raw.lock().clear();
        debug!("streaming data reset");
    }

    /// Latest running average
    pub fn running_average(&self) -> Option<ProcessedCurve> {
        self.shared.aggregator.lock().average().current().cloned()
    }

    /// Curves in the averaging window
    pub fn history_len(&self) -> usize {
        self.shared.aggregator.lock().average().history().len()
    }

    /// Raw frame mean and the number of frames in it
    pub fn raw_average(&self) -> (Vec<f64>, usize) {
        let raw = self.shared.raw.lock();
        (raw.mean().to_vec(), raw.count())
    }

    /// Frames dropped because the queue was full
    pub fn dropped_frames(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    /// Write raw average, curve history, running average and settings to a
    /// new sink.
    pub fn save_snapshot(&self, dir: impl AsRef<Path>, name: &str, replace: bool) -> AppResult<PathBuf> {
        let (raw, raw_count) = self.raw_average();
        let (history, average) = {
            let aggregator = self.shared.aggregator.lock();
            let average = aggregator.average();
            (
                average.history().iter().cloned().collect::<Vec<_>>(),
                average.current().cloned(),
            )
        };
        let settings = serde_json::to_value(self.settings())?;

        let mut sink = SinkFile::create(dir, name, replace)?;
        let root = sink.root_mut();
        root.write_dataset(
            "raw/avg",
            Dataset::vector(raw).with_attr("count", raw_count as i64),
        )?;

        let bins: BTreeSet<i64> = history.iter().flat_map(|c| c.bins.keys().copied()).collect();
        let time_step = history.last().map_or(0.0, |c| c.time_step);
        let rows: Vec<Vec<f64>> = history
            .iter()
            .map(|curve| {
                bins.iter()
                    .map(|bin| curve.value_at_bin(*bin).unwrap_or(f64::NAN))
                    .collect()
            })
            .collect();
        root.write_dataset("all_data/data", Dataset::matrix(&rows)?)?;
        root.write_dataset(
            "all_data/time_axis",
            Dataset::vector(bins.iter().map(|&b| b as f64 * time_step).collect()),
        )?;

        let (avg_values, avg_axis) = average
            .map(|a| (a.values(), a.time_axis()))
            .unwrap_or_default();
        root.write_dataset("avg/data", Dataset::vector(avg_values))?;
        root.write_dataset("avg/time_axis", Dataset::vector(avg_axis))?;

        if let serde_json::Value::Object(fields) = settings {
            for (key, value) in fields {
                if let Some(value) = SinkValue::from_json(&value) {
                    root.set_attr("settings", key, value);
                }
            }
        }
        sink.flush()?;
        info!(path = %sink.path().display(), curves = history.len(), "snapshot saved");
        Ok(sink.path().to_path_buf())
    }

    /// Move the delay stage.
    ///
    /// Allowed while this coordinator streams, since the stage only sets the
    /// delay offset of the fast scan. Otherwise the hardware is claimed for
    /// the duration of the move, so a running sweep or calibration turns the
    /// request into `ResourceBusy` without touching the stage.
    pub async fn move_stage(&self, position: f64) -> AppResult<()> {
        let _guard = match self.arbiter.try_acquire(HardwareOwner::ManualMove) {
            Ok(guard) => Some(guard),
            Err(_) if self.is_streaming() => None,
            Err(err) => return Err(err),
        };
        self.stage
            .move_abs(position)
            .await
            .map_err(DaqError::from_hardware)
    }

    /// Delay stage position
    pub async fn stage_position(&self) -> AppResult<f64> {
        self.stage.position().await.map_err(DaqError::from_hardware)
    }

    /// Run the shaker calibration.
    ///
    /// Fails with `ResourceBusy`, before moving anything, while streaming or
    /// a sweep holds the hardware.
    pub async fn calibrate_shaker(&self, config: &CalibrationConfig) -> AppResult<CalibrationResult> {
        let _guard = self.arbiter.try_acquire(HardwareOwner::Calibration)?;
        let settings = self.settings();
        shaker_calibration::run(&self.stage, &self.source, &settings, config).await
    }

    /// Stop streaming now and end the lifecycle tick.
    pub fn close(&self) {
        self.stop_streamer();
        let session = self.shared.session.lock().take();
        if let Some(session) = session {
            self.shared.teardown(session);
        }
        self.ticking.store(false, Ordering::SeqCst);
        if let Some(ticker) = self.ticker.lock().take() {
            if ticker.join().is_err() {
                error!("tick thread panicked");
            }
        }
    }
}

impl Drop for AcquisitionCoordinator {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::capabilities::FrameSource;
    use crate::hardware::mock::{AutocorrelatorParams, MockStage, SimulatedAutocorrelator};

    fn settings() -> FastScanConfig {
        FastScanConfig {
            n_processors: 1,
            n_samples: 400,
            n_averages: 3,
            tick_interval_ms: 5,
            ..FastScanConfig::default()
        }
    }

    fn coordinator(arbiter: HardwareArbiter) -> AcquisitionCoordinator {
        let params = AutocorrelatorParams {
            frame_period: Duration::from_millis(1),
            ..Default::default()
        };
        let source: Box<dyn FrameSource> = Box::new(SimulatedAutocorrelator::new(params));
        AcquisitionCoordinator::new(
            settings(),
            Arc::new(Mutex::new(source)),
            Arc::new(MockStage::with_speed(1e9)),
            arbiter,
        )
        .unwrap()
    }

    fn wait_until(mut done: impl FnMut() -> bool) {
        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        while !done() {
            assert!(std::time::Instant::now() < deadline, "timed out");
            thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn teardown_is_deferred_to_the_tick() {
        let arbiter = HardwareArbiter::new();
        let acq = coordinator(arbiter.clone());
        acq.start_streamer().unwrap();
        assert!(matches!(acq.start_streamer(), Err(DaqError::ResourceBusy(_))));
        wait_until(|| acq.history_len() == 3);

        acq.stop_streamer();
        wait_until(|| !acq.is_streaming());
        assert_eq!(arbiter.owner(), None);
        assert!(acq.running_average().is_some());
    }

    #[test]
    fn window_change_recomputes_immediately() {
        let acq = coordinator(HardwareArbiter::new());
        acq.start_streamer().unwrap();
        wait_until(|| acq.history_len() == 3);
        acq.stop_streamer();
        wait_until(|| !acq.is_streaming());

        acq.set_n_averages(1).unwrap();
        assert_eq!(acq.history_len(), 1);
        assert!(acq.set_n_averages(0).is_err());
        assert_eq!(acq.settings().n_averages, 1);
    }

    #[test]
    fn invalid_setters_change_nothing() {
        let acq = coordinator(HardwareArbiter::new());
        assert!(acq.set_shaker_gain(7).is_err());
        assert!(acq.set_n_processors(0).is_err());
        assert!(acq.set_shaker_ps_per_step(-1.0).is_err());
        assert_eq!(acq.settings(), settings());
    }

    #[test]
    fn reset_clears_all_averages() {
        let acq = coordinator(HardwareArbiter::new());
        acq.start_streamer().unwrap();
        wait_until(|| acq.raw_average().1 >= 2);
        acq.close();

        acq.reset_data();
        assert!(acq.running_average().is_none());
        assert_eq!(acq.raw_average().1, 0);
        assert!(matches!(acq.start_streamer(), Err(DaqError::Validation(_))));
    }
}
