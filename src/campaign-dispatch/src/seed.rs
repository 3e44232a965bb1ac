//! Startup seed file: open events, campaigns to schedule and queued jobs.
//!
//! ```json
//! {
//!   "opens": [{ "subscriber_id": "…", "campaign_id": "…",
//!               "opened_at": "2024-06-04T20:15:00+02:00" }],
//!   "campaigns": [{ "name": "June news", "subject": "Hi",
//!                   "total_recipients": 500, "recipients": ["…"] }],
//!   "imports": [{ "file_path": "/data/subscribers.csv" }],
//!   "validations": [{ "emails": ["a@example.com"] }]
//! }
//! ```

use std::path::Path;

use anyhow::Context;
use chrono::{DateTime, FixedOffset, Utc};
use serde::Deserialize;
use tracing::{info, warn};
use uuid::Uuid;

use campaign_batch::{ImportJobPayload, QueueService, ValidationJobPayload};
use campaign_intelligent_delivery::SendTimeOptimizer;
use campaign_scheduler::CampaignScheduler;

#[derive(Debug, Default, Deserialize)]
pub struct SeedFile {
    #[serde(default)]
    pub opens: Vec<SeedOpen>,
    #[serde(default)]
    pub campaigns: Vec<SeedCampaign>,
    #[serde(default)]
    pub imports: Vec<SeedImport>,
    #[serde(default)]
    pub validations: Vec<SeedValidation>,
}

#[derive(Debug, Deserialize)]
pub struct SeedOpen {
    pub subscriber_id: Uuid,
    pub campaign_id: Uuid,
    pub opened_at: DateTime<FixedOffset>,
}

/// A campaign is scheduled at `scheduled_at` when given, otherwise at the
/// optimal send time for `recipients`. With neither it stays a draft.
#[derive(Debug, Deserialize)]
pub struct SeedCampaign {
    pub name: String,
    pub subject: String,
    pub total_recipients: u64,
    pub scheduled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub recipients: Vec<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct SeedImport {
    pub file_path: String,
    pub import_job_id: Option<Uuid>,
    #[serde(default)]
    pub options: serde_json::Value,
}

#[derive(Debug, Deserialize)]
pub struct SeedValidation {
    pub emails: Vec<String>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SeedReport {
    pub opens: usize,
    pub campaigns: usize,
    pub scheduled: usize,
    pub imports: usize,
    pub validations: usize,
}

pub async fn load(path: &Path) -> anyhow::Result<SeedFile> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading seed file {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing seed file {}", path.display()))
}

/// Opens go in first so campaigns without a fixed time can use them.
pub fn apply(
    seed: SeedFile,
    scheduler: &CampaignScheduler,
    queues: &QueueService,
    optimizer: &SendTimeOptimizer,
    now: DateTime<Utc>,
) -> anyhow::Result<SeedReport> {
    let mut report = SeedReport::default();

    for open in seed.opens {
        if optimizer
            .history()
            .record_open(open.subscriber_id, open.campaign_id, open.opened_at)
            .is_some()
        {
            report.opens += 1;
        }
    }

    for entry in seed.campaigns {
        let campaign = scheduler.create_draft(entry.name, entry.subject, entry.total_recipients);
        report.campaigns += 1;

        let at = match entry.scheduled_at {
            Some(at) => at,
            None if !entry.recipients.is_empty() => {
                let best = optimizer.optimal_time_for_campaign(&entry.recipients, now);
                info!(
                    campaign_id = %campaign.id,
                    hour = best.optimal_hour,
                    day = best.optimal_day,
                    confidence = best.confidence,
                    method = ?best.method,
                    "Using optimal send time"
                );
                best.next_send_at
            }
            None => continue,
        };

        match scheduler.schedule_campaign(&campaign.id, at) {
            Ok(_) => report.scheduled += 1,
            Err(e) => warn!(campaign_id = %campaign.id, error = %e, "Seed campaign left as draft"),
        }
    }

    for import in seed.imports {
        queues.queue_import_job(&ImportJobPayload {
            import_job_id: import.import_job_id.unwrap_or_else(Uuid::new_v4),
            file_path: import.file_path,
            options: import.options,
        })?;
        report.imports += 1;
    }

    for validation in seed.validations {
        queues.queue_validation_job(&ValidationJobPayload {
            validation_id: Uuid::new_v4(),
            emails: validation.emails,
            options: serde_json::Value::Null,
        })?;
        report.validations += 1;
    }

    info!(
        opens = report.opens,
        campaigns = report.campaigns,
        scheduled = report.scheduled,
        imports = report.imports,
        validations = report.validations,
        "Seed applied"
    );
    Ok(report)
}
