//! Collaborators the binary plugs into the scheduler and the queue workers.

use anyhow::Context;
use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, info};

use campaign_batch::{BatchProcessor, ImportJobPayload, Job, JobHandler, ValidationJobPayload};
use campaign_core::types::Campaign;
use campaign_scheduler::{CampaignSender, SendOutcome};

/// Hands recipients to the delivery pipeline in batches. Actual SMTP
/// delivery lives outside this process; each batch is logged as delivered.
pub struct BatchedSender {
    batch: BatchProcessor,
}

impl BatchedSender {
    pub fn new(batch: BatchProcessor) -> Self {
        Self { batch }
    }
}

#[async_trait]
impl CampaignSender for BatchedSender {
    async fn send_campaign(&self, campaign: &Campaign) -> anyhow::Result<SendOutcome> {
        let campaign_id = campaign.id;
        let recipients: Vec<u64> = (0..campaign.total_recipients).collect();

        let outcome = self
            .batch
            .process_batches(recipients, move |chunk: Vec<u64>| async move {
                debug!(
                    campaign_id = %campaign_id,
                    size = chunk.len(),
                    "Delivering recipient batch"
                );
                Ok::<_, anyhow::Error>(chunk)
            })
            .await;

        if outcome.total_items > 0 && outcome.processed_items == 0 {
            let reason = outcome
                .failures
                .first()
                .map(|f| f.error.clone())
                .unwrap_or_default();
            anyhow::bail!("no recipient batch was delivered: {}", reason);
        }

        Ok(SendOutcome {
            recipients: campaign.total_recipients,
            sent: outcome.processed_items as u64,
        })
    }
}

/// Reads a subscriber file (one address per line, optional header) and
/// validates the addresses in batches.
pub struct ImportHandler {
    batch: BatchProcessor,
}

impl ImportHandler {
    pub fn new(batch: BatchProcessor) -> Self {
        Self { batch }
    }
}

#[async_trait]
impl JobHandler for ImportHandler {
    async fn handle(&self, job: &Job) -> anyhow::Result<serde_json::Value> {
        let payload: ImportJobPayload =
            serde_json::from_value(job.payload.clone()).context("invalid import payload")?;
        let contents = tokio::fs::read_to_string(&payload.file_path)
            .await
            .with_context(|| format!("reading import file {}", payload.file_path))?;

        let emails = parse_addresses(&contents);
        let (valid, invalid, failed_batches) =
            validate_in_batches(&self.batch, emails.clone()).await;

        info!(
            import_job_id = %payload.import_job_id,
            total = emails.len(),
            valid = valid.len(),
            invalid = invalid.len(),
            "Import file processed"
        );
        Ok(json!({
            "import_job_id": payload.import_job_id,
            "total": emails.len(),
            "imported": valid.len(),
            "invalid": invalid.len(),
            "failed_batches": failed_batches,
        }))
    }
}

pub struct ValidationHandler {
    batch: BatchProcessor,
}

impl ValidationHandler {
    pub fn new(batch: BatchProcessor) -> Self {
        Self { batch }
    }
}

#[async_trait]
impl JobHandler for ValidationHandler {
    async fn handle(&self, job: &Job) -> anyhow::Result<serde_json::Value> {
        let payload: ValidationJobPayload =
            serde_json::from_value(job.payload.clone()).context("invalid validation payload")?;
        let total = payload.emails.len();
        let (valid, invalid, failed_batches) =
            validate_in_batches(&self.batch, payload.emails).await;

        info!(
            validation_id = %payload.validation_id,
            total,
            valid = valid.len(),
            invalid = invalid.len(),
            "Validation job processed"
        );
        Ok(json!({
            "validation_id": payload.validation_id,
            "total": total,
            "valid": valid.len(),
            "invalid": invalid,
            "failed_batches": failed_batches,
        }))
    }
}

async fn validate_in_batches(
    batch: &BatchProcessor,
    emails: Vec<String>,
) -> (Vec<String>, Vec<String>, usize) {
    let outcome = batch
        .process_batches(emails, |chunk: Vec<String>| async move {
            let checked: Vec<(String, bool)> = chunk
                .into_iter()
                .map(|email| {
                    let ok = is_valid_email(&email);
                    (email, ok)
                })
                .collect();
            Ok::<_, anyhow::Error>(checked)
        })
        .await;

    let (valid, invalid): (Vec<_>, Vec<_>) = outcome.results.into_iter().partition(|(_, ok)| *ok);
    (
        valid.into_iter().map(|(email, _)| email).collect(),
        invalid.into_iter().map(|(email, _)| email).collect(),
        outcome.failures.len(),
    )
}

fn parse_addresses(contents: &str) -> Vec<String> {
    let mut lines = contents
        .lines()
        .map(|line| line.split(',').next().unwrap_or_default().trim())
        .filter(|line| !line.is_empty())
        .peekable();
    // Header row such as "email"
    if lines.peek().map(|first| !first.contains('@')).unwrap_or(false) {
        lines.next();
    }
    lines.map(str::to_lowercase).collect()
}

pub fn is_valid_email(email: &str) -> bool {
    if email.chars().any(char::is_whitespace) {
        return false;
    }
    let Some((local, domain)) = email.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !domain.contains('@')
        && domain.contains('.')
        && !domain.starts_with('.')
        && !domain.ends_with('.')
}
