//! Frame producer thread.
//!
//! Runs the blocking [`FrameSource`] on a dedicated OS thread and hands every
//! frame to a callback. The callback must not block on downstream work; the
//! only blocking in the loop is frame generation itself.

use crate::error::{AppResult, DaqError};
use crate::hardware::capabilities::FrameSource;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info};

/// Frame source shared by the producer and single-shot acquisitions.
pub type SharedSource = Arc<Mutex<Box<dyn FrameSource>>>;

/// Acquisition parameters fixed for the lifetime of one producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProducerSettings {
    /// Samples per frame
    pub n_samples: usize,
    /// Alternate pumped/unpumped samples
    pub dark_control: bool,
}

/// Handle to a running producer thread.
pub struct StreamProducer {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    frames: Arc<AtomicU64>,
}

impl StreamProducer {
    /// Start producing.
    ///
    /// `on_frame` receives every frame in acquisition order. `on_error` is
    /// called once if the source fails; the producer then stops by itself.
    pub fn start<F, E>(
        source: SharedSource,
        settings: ProducerSettings,
        mut on_frame: F,
        on_error: E,
    ) -> AppResult<Self>
    where
        F: FnMut(Vec<f64>) + Send + 'static,
        E: FnOnce(DaqError) + Send + 'static,
    {
        let running = Arc::new(AtomicBool::new(true));
        let frames = Arc::new(AtomicU64::new(0));
        let flag = running.clone();
        let counter = frames.clone();

        let handle = thread::Builder::new()
            .name("femtoscan-producer".into())
            .spawn(move || {
                info!(
                    n_samples = settings.n_samples,
                    dark_control = settings.dark_control,
                    "producer started"
                );
                while flag.load(Ordering::SeqCst) {
                    let acquired = source
                        .lock()
                        .acquire(settings.n_samples, settings.dark_control);
                    match acquired {
                        Ok(frame) => {
                            counter.fetch_add(1, Ordering::Relaxed);
                            on_frame(frame);
                        }
                        Err(err) => {
                            let err = DaqError::from_hardware(err);
                            error!("frame acquisition failed: {err}");
                            flag.store(false, Ordering::SeqCst);
                            on_error(err);
                            break;
                        }
                    }
                }
                debug!(frames = counter.load(Ordering::Relaxed), "producer loop exited");
            })?;

        Ok(Self {
            running,
            handle: Some(handle),
            frames,
        })
    }

    /// Ask the loop to exit after the frame in progress.
    pub fn signal_stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Whether the loop is still meant to run
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Whether the thread has exited
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Frames produced so far
    pub fn frame_count(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    /// Stop and wait for the thread.
    pub fn join(mut self) {
        self.signal_stop();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("producer thread panicked");
            }
        }
    }
}

impl Drop for StreamProducer {
    fn drop(&mut self) {
        self.signal_stop();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
