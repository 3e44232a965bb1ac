use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use campaign_core::config::SchedulerConfig;
use campaign_core::error::{CampaignError, CampaignResult};
use campaign_core::event_bus::{make_event, EventSink};
use campaign_core::types::{Campaign, CampaignStatus, EventType};

use crate::sender::CampaignSender;
use crate::store::CampaignStore;

/// Summary of one scheduler tick.
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct TickReport {
    pub due: usize,
    pub sent: usize,
    pub failed: usize,
    /// Due campaigns another tick claimed first.
    pub skipped: usize,
}

/// Moves campaigns through `draft -> scheduled -> sending -> sent | failed`
/// and dispatches the ones whose time has come.
pub struct CampaignScheduler {
    store: Arc<dyn CampaignStore>,
    sender: Arc<dyn CampaignSender>,
    event_sink: Arc<dyn EventSink>,
    tick_interval: Duration,
}

impl std::fmt::Debug for CampaignScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CampaignScheduler")
            .field("tick_interval", &self.tick_interval)
            .finish()
    }
}

impl CampaignScheduler {
    pub fn new(
        store: Arc<dyn CampaignStore>,
        sender: Arc<dyn CampaignSender>,
        config: &SchedulerConfig,
    ) -> Self {
        Self {
            store,
            sender,
            event_sink: campaign_core::event_bus::noop_sink(),
            tick_interval: Duration::from_secs(config.tick_interval_secs.max(1)),
        }
    }

    /// Attach an event sink for lifecycle events.
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    /// Stores a new draft campaign and returns it.
    pub fn create_draft(
        &self,
        name: impl Into<String>,
        subject: impl Into<String>,
        total_recipients: u64,
    ) -> Campaign {
        let campaign = Campaign::draft(name, subject, total_recipients);
        info!(campaign_id = %campaign.id, name = %campaign.name, "Created draft campaign");
        self.store.insert(campaign.clone());
        campaign
    }

    pub fn get_campaign(&self, id: &Uuid) -> Option<Campaign> {
        self.store.get(id)
    }

    /// Scheduled campaigns, earliest first.
    pub fn list_scheduled(&self) -> Vec<Campaign> {
        let mut scheduled = self.store.with_status(CampaignStatus::Scheduled);
        scheduled.sort_by_key(|c| c.scheduled_at);
        scheduled
    }

    /// Unknown ids fail with `NotFound` before the time is checked.
    pub fn schedule_campaign(&self, id: &Uuid, at: DateTime<Utc>) -> CampaignResult<Campaign> {
        self.ensure_exists(id)?;
        ensure_future(at, Utc::now())?;
        let campaign = self.store.update(id, &mut |c| {
            expect_status(c, CampaignStatus::Draft)?;
            c.status = CampaignStatus::Scheduled;
            c.scheduled_at = Some(at);
            Ok(())
        })?;

        info!(campaign_id = %id, scheduled_at = %at, "Campaign scheduled");
        self.emit(EventType::CampaignScheduled, id, serde_json::json!({ "scheduled_at": at }));
        Ok(campaign)
    }

    pub fn cancel_scheduled_campaign(&self, id: &Uuid) -> CampaignResult<Campaign> {
        let campaign = self.store.update(id, &mut |c| {
            expect_status(c, CampaignStatus::Scheduled)?;
            c.status = CampaignStatus::Draft;
            c.scheduled_at = None;
            Ok(())
        })?;

        info!(campaign_id = %id, "Scheduled campaign cancelled");
        self.emit(EventType::CampaignCancelled, id, serde_json::json!({}));
        Ok(campaign)
    }

    pub fn reschedule_campaign(&self, id: &Uuid, at: DateTime<Utc>) -> CampaignResult<Campaign> {
        self.ensure_exists(id)?;
        ensure_future(at, Utc::now())?;
        let mut previous = None;
        let campaign = self.store.update(id, &mut |c| {
            expect_status(c, CampaignStatus::Scheduled)?;
            previous = c.scheduled_at;
            c.scheduled_at = Some(at);
            Ok(())
        })?;

        info!(campaign_id = %id, scheduled_at = %at, "Campaign rescheduled");
        self.emit(
            EventType::CampaignRescheduled,
            id,
            serde_json::json!({ "previous": previous, "scheduled_at": at }),
        );
        Ok(campaign)
    }

    /// One scheduler tick against the current time.
    pub async fn process_scheduled_campaigns(&self) -> TickReport {
        self.process_due_at(Utc::now()).await
    }

    /// Sends every campaign due at `now`, one after another. A failing
    /// campaign is marked `failed` and the loop moves on.
    pub async fn process_due_at(&self, now: DateTime<Utc>) -> TickReport {
        let due = self.store.due_scheduled(now);
        let mut report = TickReport {
            due: due.len(),
            ..TickReport::default()
        };

        if due.is_empty() {
            return report;
        }
        info!(count = due.len(), "Processing due campaigns");

        for campaign in due {
            let claimed = match self.store.update(&campaign.id, &mut |c| {
                expect_status(c, CampaignStatus::Scheduled)?;
                c.status = CampaignStatus::Sending;
                Ok(())
            }) {
                Ok(claimed) => claimed,
                Err(e) => {
                    debug!(campaign_id = %campaign.id, error = %e, "Campaign claimed elsewhere");
                    report.skipped += 1;
                    continue;
                }
            };

            if self.dispatch(claimed).await {
                report.sent += 1;
            } else {
                report.failed += 1;
            }
        }

        info!(
            due = report.due,
            sent = report.sent,
            failed = report.failed,
            skipped = report.skipped,
            "Scheduler tick finished"
        );
        report
    }

    /// Runs ticks on the configured interval until `shutdown` flips to true
    /// or its sender is dropped.
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.tick_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(
                interval_ms = self.tick_interval.as_millis() as u64,
                "Campaign scheduler started"
            );

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        self.process_scheduled_campaigns().await;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }

            info!("Campaign scheduler stopped");
        })
    }

    async fn dispatch(&self, campaign: Campaign) -> bool {
        let id = campaign.id;
        match self.sender.send_campaign(&campaign).await {
            Ok(outcome) => {
                let result = self.store.update(&id, &mut |c| {
                    c.status = CampaignStatus::Sent;
                    c.sent_at = Some(Utc::now());
                    c.sent_count = outcome.sent;
                    if outcome.recipients > 0 {
                        c.total_recipients = outcome.recipients;
                    }
                    Ok(())
                });
                if let Err(e) = result {
                    error!(campaign_id = %id, error = %e, "Failed to mark campaign sent");
                }

                metrics::counter!("scheduler.campaigns_sent").increment(1);
                info!(campaign_id = %id, sent = outcome.sent, "Campaign sent");
                self.emit(
                    EventType::CampaignSent,
                    &id,
                    serde_json::json!({ "recipients": outcome.recipients, "sent": outcome.sent }),
                );
                true
            }
            Err(e) => {
                let message = e.to_string();
                let failed_at = Utc::now();
                let result = self.store.update(&id, &mut |c| {
                    c.status = CampaignStatus::Failed;
                    c.set_metadata("error", serde_json::json!(message));
                    c.set_metadata("failed_at", serde_json::json!(failed_at));
                    Ok(())
                });
                if let Err(store_err) = result {
                    warn!(
                        campaign_id = %id,
                        error = %store_err,
                        "Failed to record campaign failure"
                    );
                }

                metrics::counter!("scheduler.campaigns_failed").increment(1);
                error!(campaign_id = %id, error = %message, "Scheduled campaign send failed");
                self.emit(EventType::CampaignFailed, &id, serde_json::json!({ "error": message }));
                false
            }
        }
    }

    fn ensure_exists(&self, id: &Uuid) -> CampaignResult<()> {
        self.store
            .get(id)
            .map(|_| ())
            .ok_or(CampaignError::NotFound(*id))
    }

    fn emit(&self, event_type: EventType, id: &Uuid, detail: serde_json::Value) {
        self.event_sink.emit(make_event(event_type, Some(*id), None, detail));
    }
}

fn ensure_future(at: DateTime<Utc>, now: DateTime<Utc>) -> CampaignResult<()> {
    if at <= now {
        return Err(CampaignError::InvalidSchedule(format!(
            "scheduled time {} is not in the future",
            at.to_rfc3339()
        )));
    }
    Ok(())
}

fn expect_status(campaign: &Campaign, expected: CampaignStatus) -> CampaignResult<()> {
    if campaign.status != expected {
        return Err(CampaignError::InvalidState {
            id: campaign.id,
            expected,
            actual: campaign.status,
        });
    }
    Ok(())
}
