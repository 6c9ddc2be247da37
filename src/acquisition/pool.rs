//! Fixed-size processing pool.
//!
//! `n` worker threads take jobs from one bounded crossbeam channel. Submission
//! never blocks: a full queue hands the job back to the caller. Completion
//! order across workers is unspecified.

use crate::data::processor::{ProcessedCurve, StreamFrame};
use crate::error::{AppResult, DaqError};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error};

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Work item for the pool.
#[derive(Debug, Clone)]
pub enum Job {
    /// Project a raw frame onto the delay axis
    Project(StreamFrame),
    /// Fit the autocorrelation peak of an averaged curve
    Fit(ProcessedCurve),
}

/// Cloneable, non-blocking entry point into the pool's queue.
#[derive(Debug, Clone)]
pub struct JobSubmitter {
    sender: Sender<Job>,
}

impl JobSubmitter {
    /// Queue `job`, or hand it back if the queue is full or closed.
    pub fn try_submit(&self, job: Job) -> Result<(), Job> {
        self.sender.try_send(job).map_err(|err| match err {
            TrySendError::Full(job) | TrySendError::Disconnected(job) => job,
        })
    }

    /// Jobs waiting in the queue
    pub fn queued(&self) -> usize {
        self.sender.len()
    }
}

/// Called by a worker for every job it takes.
pub type JobHandler = Arc<dyn Fn(Job, &JobSubmitter) + Send + Sync>;

/// Worker threads sharing one bounded job queue.
pub struct ProcessingWorkerPool {
    submitter: JobSubmitter,
    shutdown: Arc<AtomicBool>,
    workers: Vec<JoinHandle<()>>,
}

impl ProcessingWorkerPool {
    /// Start `size` workers on a queue holding `capacity` jobs.
    pub fn new(size: usize, capacity: usize, handler: JobHandler) -> AppResult<Self> {
        if size == 0 || capacity == 0 {
            return Err(DaqError::Validation(format!(
                "pool needs at least one worker and queue slot (got {size} workers, capacity {capacity})"
            )));
        }
        let (sender, receiver) = bounded::<Job>(capacity);
        let submitter = JobSubmitter { sender };
        let shutdown = Arc::new(AtomicBool::new(false));

        let workers = (0..size)
            .map(|id| {
                let receiver = receiver.clone();
                let submitter = submitter.clone();
                let shutdown = shutdown.clone();
                let handler = handler.clone();
                thread::Builder::new()
                    .name(format!("femtoscan-worker-{id}"))
                    .spawn(move || worker_loop(id, &receiver, &submitter, &shutdown, &handler))
            })
            .collect::<Result<Vec<_>, _>>()?;

        debug!(size, capacity, "processing pool started");
        Ok(Self {
            submitter,
            shutdown,
            workers,
        })
    }

    /// Submission handle for the producer
    pub fn submitter(&self) -> JobSubmitter {
        self.submitter.clone()
    }

    /// Number of worker threads
    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Drain the queue, then stop and join every worker.
    pub fn shutdown(mut self) {
        self.stop_workers();
    }

    fn stop_workers(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                error!("processing worker panicked");
            }
        }
    }
}

impl Drop for ProcessingWorkerPool {
    fn drop(&mut self) {
        self.stop_workers();
    }
}

fn worker_loop(
    id: usize,
    receiver: &Receiver<Job>,
    submitter: &JobSubmitter,
    shutdown: &AtomicBool,
    handler: &JobHandler,
) {
    loop {
        match receiver.recv_timeout(POLL_INTERVAL) {
            Ok(job) => handler(job, submitter),
            Err(RecvTimeoutError::Timeout) => {
                if shutdown.load(Ordering::SeqCst) && receiver.is_empty() {
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    debug!(worker = id, "processing worker exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn frame(seq: u64) -> Job {
        Job::Project(StreamFrame {
            seq,
            samples: vec![0.0, 1.0],
        })
    }

    #[test]
    fn every_queued_job_is_handled_before_shutdown_returns() {
        let handled = Arc::new(Mutex::new(Vec::new()));
        let log = handled.clone();
        let pool = ProcessingWorkerPool::new(
            3,
            64,
            Arc::new(move |job: Job, _: &JobSubmitter| {
                if let Job::Project(frame) = job {
                    log.lock().push(frame.seq);
                }
            }),
        )
        .unwrap();

        let submitter = pool.submitter();
        for seq in 0..50 {
            while submitter.try_submit(frame(seq)).is_err() {
                std::thread::yield_now();
            }
        }
        pool.shutdown();

        let mut handled = handled.lock().clone();
        handled.sort_unstable();
        assert_eq!(handled, (0..50).collect::<Vec<_>>());
    }

    #[test]
    fn full_queue_returns_the_job() {
        let gate = Arc::new(Mutex::new(()));
        let held = gate.lock();
        let blocker = gate.clone();
        let pool = ProcessingWorkerPool::new(
            1,
            1,
            Arc::new(move |_: Job, _: &JobSubmitter| {
                let _wait = blocker.lock();
            }),
        )
        .unwrap();
        let submitter = pool.submitter();

        // one job in the worker, one in the queue, the next is refused
        let mut refused = None;
        for seq in 0..10 {
            if let Err(job) = submitter.try_submit(frame(seq)) {
                refused = Some(job);
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(matches!(refused, Some(Job::Project(_))));
        drop(held);
        pool.shutdown();
    }

    #[test]
    fn zero_workers_is_rejected() {
        let handler: JobHandler = Arc::new(|_: Job, _: &JobSubmitter| {});
        assert!(ProcessingWorkerPool::new(0, 4, handler).is_err());
    }
}
