//! Streaming fast-scan pipeline against the simulated autocorrelator.

use femtoscan::acquisition::{AcquisitionCoordinator, SharedSource, StreamEvent};
use femtoscan::config::FastScanConfig;
use femtoscan::data::sink::{SinkFile, SinkValue};
use femtoscan::error::DaqError;
use femtoscan::hardware::mock::{AutocorrelatorParams, MockStage, SimulatedAutocorrelator};
use femtoscan::hardware::{FrameSource, HardwareArbiter, HardwareOwner, Movable};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast::error::RecvError;

fn fastscan() -> FastScanConfig {
    FastScanConfig {
        n_processors: 1,
        n_averages: 5,
        n_samples: 2000,
        expected_pulse_duration: 0.5,
        tick_interval_ms: 5,
        ..FastScanConfig::default()
    }
}

fn shared(source: impl FrameSource + 'static) -> SharedSource {
    let source: Box<dyn FrameSource> = Box::new(source);
    Arc::new(Mutex::new(source))
}

fn simulated() -> SharedSource {
    shared(SimulatedAutocorrelator::new(AutocorrelatorParams {
        frame_period: Duration::from_millis(1),
        ..Default::default()
    }))
}

fn coordinator(source: SharedSource, arbiter: HardwareArbiter) -> AcquisitionCoordinator {
    let stage: Arc<dyn Movable> = Arc::new(MockStage::with_speed(1e9));
    AcquisitionCoordinator::new(fastscan(), source, stage, arbiter).unwrap()
}

async fn wait_until(mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting for the pipeline");
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}

#[tokio::test]
async fn test_fit_follows_the_running_average() {
    let acq = coordinator(simulated(), HardwareArbiter::new());
    acq.set_fit_autocorrelation(true);
    let mut events = acq.subscribe();
    acq.start_streamer().unwrap();

    let fit = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match events.recv().await {
                Ok(StreamEvent::FitResult { fit, .. }) => return fit,
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .unwrap();
    acq.stop_streamer();

    // simulated peak sits at zero delay with sigma 0.25 ps
    assert!(fit.center.abs() < 0.05, "center {}", fit.center);
    assert!((fit.sigma - 0.25).abs() < 0.05, "sigma {}", fit.sigma);
}

#[tokio::test]
async fn test_stop_is_followed_by_a_single_stopped_event() {
    let arbiter = HardwareArbiter::new();
    let acq = coordinator(simulated(), arbiter.clone());
    let mut events = acq.subscribe();
    acq.start_streamer().unwrap();
    assert_eq!(arbiter.owner(), Some(HardwareOwner::Streaming));
    wait_until(|| acq.history_len() >= 2).await;

    acq.stop_streamer();
    wait_until(|| !acq.is_streaming()).await;
    assert_eq!(arbiter.owner(), None);

    let mut stopped = 0;
    loop {
        match events.try_recv() {
            Ok(StreamEvent::Stopped) => stopped += 1,
            Ok(_) | Err(tokio::sync::broadcast::error::TryRecvError::Lagged(_)) => {}
            Err(_) => break,
        }
    }
    assert_eq!(stopped, 1);

    // the session is gone, so streaming can start again
    acq.start_streamer().unwrap();
    acq.close();
}

#[tokio::test]
async fn test_snapshot_contains_raw_history_average_and_settings() {
    let dir = tempfile::tempdir().unwrap();
    let acq = coordinator(simulated(), HardwareArbiter::new());
    acq.start_streamer().unwrap();
    wait_until(|| acq.history_len() == 5).await;
    acq.stop_streamer();
    wait_until(|| !acq.is_streaming()).await;

    let path = acq.save_snapshot(dir.path(), "snapshot", false).unwrap();
    assert_eq!(path.extension().unwrap(), "json");

    let sink = SinkFile::open(&path).unwrap();
    let root = sink.root();
    let raw = root.dataset("raw/avg").unwrap();
    assert_eq!(raw.data.len(), 4000);

    let all = root.dataset("all_data/data").unwrap();
    assert_eq!(all.shape[0], 5);
    assert_eq!(all.shape[1], root.dataset("all_data/time_axis").unwrap().data.len());

    let avg = root.dataset("avg/data").unwrap();
    assert_eq!(avg.data.len(), root.dataset("avg/time_axis").unwrap().data.len());
    assert!(!avg.data.is_empty());

    let settings = &root.group("settings").unwrap().attrs;
    assert_eq!(settings["n_averages"], SinkValue::Int(5));
    assert_eq!(settings["dark_control"], SinkValue::Bool(false));

    assert!(matches!(
        acq.save_snapshot(dir.path(), "snapshot", false),
        Err(DaqError::NameCollision(_))
    ));
}

/// Every other frame has an odd number of values and cannot be projected.
struct Flaky {
    inner: SimulatedAutocorrelator,
    frames: usize,
}

impl FrameSource for Flaky {
    fn acquire(&mut self, n_samples: usize, dark_control: bool) -> anyhow::Result<Vec<f64>> {
        let mut frame = self.inner.acquire(n_samples, dark_control)?;
        self.frames += 1;
        if self.frames % 2 == 0 {
            frame.pop();
        }
        Ok(frame)
    }
}

#[tokio::test]
async fn test_failed_projections_do_not_stall_the_average() {
    let source = shared(Flaky {
        inner: SimulatedAutocorrelator::new(AutocorrelatorParams {
            frame_period: Duration::from_millis(1),
            ..Default::default()
        }),
        frames: 0,
    });
    let acq = coordinator(source, HardwareArbiter::new());
    let mut events = acq.subscribe();
    acq.start_streamer().unwrap();

    wait_until(|| acq.history_len() == 5).await;
    acq.close();

    let mut errors = 0;
    while let Ok(event) = events.try_recv() {
        if let StreamEvent::Error(message) = event {
            assert!(message.contains("odd number of values"), "{message}");
            errors += 1;
        }
    }
    assert!(errors >= 4);
}

#[tokio::test]
async fn test_window_shrinks_live_and_reset_clears() {
    let acq = coordinator(simulated(), HardwareArbiter::new());
    acq.start_streamer().unwrap();
    wait_until(|| acq.history_len() == 5).await;
    acq.stop_streamer();
    wait_until(|| !acq.is_streaming()).await;

    let before = acq.running_average().unwrap();
    acq.set_n_averages(2).unwrap();
    assert_eq!(acq.history_len(), 2);
    assert_eq!(acq.settings().n_averages, 2);
    assert_eq!(acq.running_average().unwrap().seq, before.seq);

    acq.reset_data();
    assert_eq!(acq.history_len(), 0);
    assert!(acq.running_average().is_none());
    assert_eq!(acq.raw_average().1, 0);
}

#[tokio::test]
async fn test_streaming_refused_while_a_sweep_holds_the_hardware() {
    let arbiter = HardwareArbiter::new();
    let acq = coordinator(simulated(), arbiter.clone());
    let _sweep = arbiter.try_acquire(HardwareOwner::Sweep).unwrap();

    assert!(matches!(acq.start_streamer(), Err(DaqError::ResourceBusy(_))));
    assert!(!acq.is_streaming());
}

#[tokio::test]
async fn test_stage_moves_only_when_no_other_path_drives_it() {
    let arbiter = HardwareArbiter::new();
    let stage = Arc::new(MockStage::with_speed(1e9));
    let acq = AcquisitionCoordinator::new(fastscan(), simulated(), stage.clone(), arbiter.clone())
        .unwrap();

    let sweep = arbiter.try_acquire(HardwareOwner::Sweep).unwrap();
    assert!(matches!(acq.move_stage(3.0).await, Err(DaqError::ResourceBusy(_))));
    drop(sweep);
    let calibration = arbiter.try_acquire(HardwareOwner::Calibration).unwrap();
    assert!(matches!(acq.move_stage(3.0).await, Err(DaqError::ResourceBusy(_))));
    drop(calibration);
    assert_eq!(stage.move_count(), 0);

    acq.move_stage(3.0).await.unwrap();
    assert_eq!(arbiter.owner(), None);

    acq.start_streamer().unwrap();
    acq.move_stage(1.5).await.unwrap();
    assert_eq!(arbiter.owner(), Some(HardwareOwner::Streaming));
    assert_eq!(stage.move_count(), 2);
    assert_eq!(stage.current_position(), 1.5);
    acq.close();
}

#[tokio::test]
async fn test_invalid_settings_are_rejected_atomically() {
    let acq = coordinator(simulated(), HardwareArbiter::new());
    let mut settings = acq.settings();
    settings.n_samples = 0;
    settings.n_averages = 9;

    assert!(acq.apply_settings(settings).is_err());
    assert_eq!(acq.settings(), fastscan());
}
