//! Import and validation queues behind one facade.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use campaign_core::config::QueueConfig;
use campaign_core::error::CampaignResult;
use campaign_core::event_bus::{make_event, EventSink};
use campaign_core::types::EventType;

use crate::queue::{JobOptions, JobQueue, JobState, QueueCounts};

pub const IMPORT_QUEUE: &str = "email-import";
pub const VALIDATION_QUEUE: &str = "email-validation";
pub const PROCESS_IMPORT_JOB: &str = "process-import";
pub const VALIDATE_EMAILS_JOB: &str = "validate-emails";

/// Subscriber import request handed to the import queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImportJobPayload {
    pub import_job_id: Uuid,
    pub file_path: String,
    #[serde(default)]
    pub options: serde_json::Value,
}

/// Bulk address validation request handed to the validation queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ValidationJobPayload {
    pub validation_id: Uuid,
    pub emails: Vec<String>,
    #[serde(default)]
    pub options: serde_json::Value,
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct QueueStats {
    pub import: QueueCounts,
    pub validation: QueueCounts,
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct CleanupReport {
    pub import_removed: usize,
    pub validation_removed: usize,
}

pub struct QueueService {
    import: Arc<JobQueue>,
    validation: Arc<JobQueue>,
    config: QueueConfig,
    event_sink: Arc<dyn EventSink>,
}

impl QueueService {
    pub fn new(config: &QueueConfig) -> Self {
        Self {
            import: Arc::new(JobQueue::new(IMPORT_QUEUE)),
            validation: Arc::new(JobQueue::new(VALIDATION_QUEUE)),
            config: config.clone(),
            event_sink: campaign_core::event_bus::noop_sink(),
        }
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    pub fn import_queue(&self) -> &Arc<JobQueue> {
        &self.import
    }

    pub fn validation_queue(&self) -> &Arc<JobQueue> {
        &self.validation
    }

    pub fn cleanup_grace(&self) -> Duration {
        Duration::from_secs(self.config.cleanup_grace_secs)
    }

    pub fn queue_import_job(&self, payload: &ImportJobPayload) -> CampaignResult<Uuid> {
        let job = self.import.add(
            PROCESS_IMPORT_JOB,
            serde_json::to_value(payload)?,
            JobOptions::from(&self.config.import),
        );
        info!(job_id = %job.id, import_job_id = %payload.import_job_id, "Queued import job");
        self.emit_queued(
            IMPORT_QUEUE,
            job.id,
            serde_json::json!({ "import_job_id": payload.import_job_id }),
        );
        Ok(job.id)
    }

    pub fn queue_validation_job(&self, payload: &ValidationJobPayload) -> CampaignResult<Uuid> {
        let job = self.validation.add(
            VALIDATE_EMAILS_JOB,
            serde_json::to_value(payload)?,
            JobOptions::from(&self.config.validation),
        );
        info!(
            job_id = %job.id,
            validation_id = %payload.validation_id,
            emails = payload.emails.len(),
            "Queued validation job"
        );
        self.emit_queued(
            VALIDATION_QUEUE,
            job.id,
            serde_json::json!({ "validation_id": payload.validation_id }),
        );
        Ok(job.id)
    }

    pub fn get_queue_stats(&self) -> QueueStats {
        QueueStats {
            import: self.import.counts(),
            validation: self.validation.counts(),
        }
    }

    pub fn pause_queues(&self) {
        self.import.pause();
        self.validation.pause();
        info!("Import and validation queues paused");
    }

    pub fn resume_queues(&self) {
        self.import.resume();
        self.validation.resume();
        info!("Import and validation queues resumed");
    }

    /// Drops completed and failed jobs that finished more than `grace` ago.
    pub fn cleanup_queues(&self, grace: Duration) -> CleanupReport {
        let now = Utc::now();
        let sweep = |queue: &JobQueue| {
            queue.clean(grace, JobState::Completed, now) + queue.clean(grace, JobState::Failed, now)
        };
        let report = CleanupReport {
            import_removed: sweep(self.import.as_ref()),
            validation_removed: sweep(self.validation.as_ref()),
        };
        info!(
            import_removed = report.import_removed,
            validation_removed = report.validation_removed,
            "Queue cleanup finished"
        );
        report
    }

    /// Removes waiting and delayed import jobs for `import_job_id`. Jobs
    /// already running are left to finish.
    pub fn cancel_import_jobs(&self, import_job_id: &Uuid) -> usize {
        let target = import_job_id.to_string();
        let mut cancelled = 0;
        for state in [JobState::Waiting, JobState::Delayed] {
            for job in self.import.jobs(state) {
                let matches = job
                    .payload
                    .get("import_job_id")
                    .and_then(|v| v.as_str())
                    .map(|id| id == target)
                    .unwrap_or(false);
                if matches && self.import.remove(&job.id) {
                    cancelled += 1;
                }
            }
        }
        info!(import_job_id = %import_job_id, cancelled, "Cancelled queued import jobs");
        cancelled
    }

    fn emit_queued(&self, queue: &str, job_id: Uuid, mut detail: serde_json::Value) {
        metrics::counter!("queue.jobs_queued").increment(1);
        if let Some(map) = detail.as_object_mut() {
            map.insert("queue".into(), serde_json::json!(queue));
        }
        self.event_sink
            .emit(make_event(EventType::JobQueued, None, Some(job_id.to_string()), detail));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::Backoff;
    use campaign_core::event_bus::capture_sink;

    fn import_payload(id: Uuid) -> ImportJobPayload {
        ImportJobPayload {
            import_job_id: id,
            file_path: "/tmp/subscribers.csv".into(),
            options: serde_json::json!({ "skip_duplicates": true }),
        }
    }

    #[test]
    fn test_import_job_uses_configured_options() {
        let sink = capture_sink();
        let service = QueueService::new(&QueueConfig::default()).with_event_sink(sink.clone());

        let job_id = service.queue_import_job(&import_payload(Uuid::new_v4())).unwrap();
        let job = service.import_queue().get(&job_id).unwrap();

        assert_eq!(job.name, PROCESS_IMPORT_JOB);
        assert_eq!(job.options.attempts, 3);
        assert_eq!(job.options.backoff, Backoff::Exponential { delay_ms: 2000 });
        assert_eq!(job.options.priority, 1);
        assert_eq!(sink.count_type(EventType::JobQueued), 1);
        assert_eq!(sink.events()[0].detail["queue"], IMPORT_QUEUE);
    }

    #[test]
    fn test_stats_pause_and_resume() {
        let service = QueueService::new(&QueueConfig::default());
        service.queue_import_job(&import_payload(Uuid::new_v4())).unwrap();
        service
            .queue_validation_job(&ValidationJobPayload {
                validation_id: Uuid::new_v4(),
                emails: vec!["a@example.com".into(), "b@example.com".into()],
                options: serde_json::Value::Null,
            })
            .unwrap();

        let stats = service.get_queue_stats();
        assert_eq!(stats.import.waiting, 1);
        assert_eq!(stats.validation.waiting, 1);
        assert!(!stats.import.paused);

        service.pause_queues();
        let stats = service.get_queue_stats();
        assert!(stats.import.paused && stats.validation.paused);
        assert!(service.import_queue().take_next(Utc::now()).is_none());

        service.resume_queues();
        assert!(service.import_queue().take_next(Utc::now()).is_some());
    }

    #[test]
    fn test_cancel_import_jobs_only_matching_and_queued() {
        let service = QueueService::new(&QueueConfig::default());
        let target = Uuid::new_v4();
        let other = Uuid::new_v4();

        let running = service.queue_import_job(&import_payload(target)).unwrap();
        service.queue_import_job(&import_payload(target)).unwrap();
        service.queue_import_job(&import_payload(other)).unwrap();

        // First job in line is now active and must survive the cancel
        let taken = service.import_queue().take_next(Utc::now()).unwrap();
        assert_eq!(taken.id, running);

        assert_eq!(service.cancel_import_jobs(&target), 1);
        let stats = service.get_queue_stats();
        assert_eq!(stats.import.waiting, 1);
        assert_eq!(stats.import.active, 1);
        assert!(service.import_queue().get(&running).is_some());
    }

    #[test]
    fn test_cleanup_queues_removes_finished_jobs() {
        let service = QueueService::new(&QueueConfig::default());
        service.queue_import_job(&import_payload(Uuid::new_v4())).unwrap();
        service.queue_import_job(&import_payload(Uuid::new_v4())).unwrap();

        let queue = service.import_queue();
        let done = queue.take_next(Utc::now()).unwrap();
        queue.complete(&done.id, serde_json::Value::Null, Utc::now()).unwrap();

        let report = service.cleanup_queues(Duration::ZERO);
        assert_eq!(report.import_removed, 1);
        assert_eq!(report.validation_removed, 0);
        assert_eq!(service.get_queue_stats().import.waiting, 1);
        assert_eq!(service.cleanup_grace(), Duration::from_secs(24 * 3600));
    }
}
