use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use campaign_core::event_bus::{make_event, EventSink};
use campaign_core::types::EventType;

use crate::queue::{Job, JobQueue, JobState};

/// Processes one job; the returned value is stored on the completed job.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> anyhow::Result<serde_json::Value>;
}

/// Pool of tokio tasks pulling jobs from a single queue.
pub struct QueueWorker {
    queue: Arc<JobQueue>,
    handler: Arc<dyn JobHandler>,
    concurrency: usize,
    poll_interval: Duration,
    event_sink: Arc<dyn EventSink>,
}

impl QueueWorker {
    pub fn new(
        queue: Arc<JobQueue>,
        handler: Arc<dyn JobHandler>,
        concurrency: usize,
        poll_interval: Duration,
    ) -> Self {
        Self {
            queue,
            handler,
            concurrency: concurrency.max(1),
            poll_interval,
            event_sink: campaign_core::event_bus::noop_sink(),
        }
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    /// Takes and processes one runnable job. Returns the state the job ended
    /// in, or `None` when nothing was runnable.
    pub async fn run_once(&self) -> Option<JobState> {
        let job = self.queue.take_next(Utc::now())?;
        Some(self.process(job).await)
    }

    /// Spawns `concurrency` workers that run until `shutdown` flips to true.
    pub fn spawn(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        info!(
            queue = %self.queue.name(),
            concurrency = self.concurrency,
            "Starting queue workers"
        );
        (0..self.concurrency)
            .map(|worker_id| {
                let worker = self.clone();
                let mut shutdown = shutdown.clone();
                tokio::spawn(async move {
                    loop {
                        if *shutdown.borrow() {
                            break;
                        }
                        if worker.run_once().await.is_some() {
                            continue;
                        }
                        tokio::select! {
                            _ = worker.queue.notified() => {}
                            _ = tokio::time::sleep(worker.poll_interval) => {}
                            changed = shutdown.changed() => {
                                if changed.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    info!(queue = %worker.queue.name(), worker_id, "Queue worker stopped");
                })
            })
            .collect()
    }

    async fn process(&self, job: Job) -> JobState {
        let queue = self.queue.name();
        let result = match job.options.timeout_ms {
            Some(ms) => {
                let limit = Duration::from_millis(ms);
                match tokio::time::timeout(limit, self.handler.handle(&job)).await {
                    Ok(result) => result,
                    Err(_) => Err(anyhow::anyhow!("job timed out after {}ms", ms)),
                }
            }
            None => self.handler.handle(&job).await,
        };

        match result {
            Ok(value) => match self.queue.complete(&job.id, value, Utc::now()) {
                Ok(_) => {
                    metrics::counter!("queue.jobs_completed").increment(1);
                    info!(queue = %queue, job_id = %job.id, name = %job.name, "Job completed");
                    self.emit(EventType::JobCompleted, &job, serde_json::json!({ "queue": queue }));
                    JobState::Completed
                }
                Err(e) => {
                    warn!(
                        queue = %queue,
                        job_id = %job.id,
                        error = %e,
                        "Could not mark job completed"
                    );
                    JobState::Completed
                }
            },
            Err(e) => {
                let reason = e.to_string();
                match self.queue.fail(&job.id, &reason, Utc::now()) {
                    Ok(JobState::Failed) => {
                        metrics::counter!("queue.jobs_failed").increment(1);
                        error!(
                            queue = %queue,
                            job_id = %job.id,
                            attempts = job.attempts_made,
                            error = %reason,
                            "Job failed permanently"
                        );
                        self.emit(
                            EventType::JobFailed,
                            &job,
                            serde_json::json!({ "queue": queue, "error": reason }),
                        );
                        JobState::Failed
                    }
                    Ok(state) => {
                        metrics::counter!("queue.jobs_retried").increment(1);
                        warn!(
                            queue = %queue,
                            job_id = %job.id,
                            attempt = job.attempts_made,
                            error = %reason,
                            "Job attempt failed, will retry"
                        );
                        state
                    }
                    Err(store_err) => {
                        warn!(
                            queue = %queue,
                            job_id = %job.id,
                            error = %store_err,
                            "Could not record job failure"
                        );
                        JobState::Failed
                    }
                }
            }
        }
    }

    fn emit(&self, event_type: EventType, job: &Job, detail: serde_json::Value) {
        self.event_sink
            .emit(make_event(event_type, None, Some(job.id.to_string()), detail));
    }
}
