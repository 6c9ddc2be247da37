//! Continuous fast-scan acquisition.
//!
//! A producer thread reads frames from the digitizer, a fixed pool of
//! processor threads projects them onto the delay axis, and a single
//! aggregator maintains the running average. [`AcquisitionCoordinator`]
//! owns the whole pipeline and the shaker calibration entry point.

pub mod aggregator;
pub mod coordinator;
pub mod pool;
pub mod producer;

pub use aggregator::Aggregator;
pub use coordinator::{AcquisitionCoordinator, StreamEvent};
pub use pool::{Job, JobSubmitter, ProcessingWorkerPool};
pub use producer::{ProducerSettings, SharedSource, StreamProducer};
