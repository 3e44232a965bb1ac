//! Batch and queue processing: a bounded-concurrency batch runner, an
//! in-process job queue with retry/backoff, queue workers, and the
//! import/validation queue facade.

pub mod processor;
pub mod queue;
pub mod service;
pub mod worker;

pub use processor::{process_batches, BatchFailure, BatchOptions, BatchOutcome, BatchProcessor};
pub use queue::{Backoff, Job, JobOptions, JobQueue, JobState, QueueCounts, MAX_DELAY};
pub use service::{
    CleanupReport, ImportJobPayload, QueueService, QueueStats, ValidationJobPayload,
};
pub use worker::{JobHandler, QueueWorker};
