//! Append-only email-open history feeding send-time optimization.

use std::sync::Arc;

use chrono::{DateTime, FixedOffset};
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use campaign_core::event_bus::{make_event, EventSink};
use campaign_core::types::{EventType, OpenHistoryRecord};

#[derive(Debug, Clone, Copy, Default)]
struct Histogram {
    hours: [u64; 24],
    days: [u64; 7],
}

pub struct OpenHistory {
    by_subscriber: DashMap<Uuid, Vec<OpenHistoryRecord>>,
    totals: Mutex<Histogram>,
    event_sink: Arc<dyn EventSink>,
}

impl Default for OpenHistory {
    fn default() -> Self {
        Self::new()
    }
}

impl OpenHistory {
    pub fn new() -> Self {
        Self {
            by_subscriber: DashMap::new(),
            totals: Mutex::new(Histogram::default()),
            event_sink: campaign_core::event_bus::noop_sink(),
        }
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    /// Records the first open of `campaign_id` by `subscriber_id`; repeated
    /// opens of the same campaign return `None`.
    pub fn record_open(
        &self,
        subscriber_id: Uuid,
        campaign_id: Uuid,
        opened_at: DateTime<FixedOffset>,
    ) -> Option<OpenHistoryRecord> {
        let record = OpenHistoryRecord::from_open(subscriber_id, campaign_id, opened_at);
        if !self.record(record.clone()) {
            return None;
        }

        self.event_sink.emit(make_event(
            EventType::EmailOpened,
            Some(campaign_id),
            Some(subscriber_id.to_string()),
            serde_json::json!({
                "hour_of_day": record.hour_of_day,
                "day_of_week": record.day_of_week,
                "timezone": record.timezone,
            }),
        ));
        Some(record)
    }

    /// Appends a record. Returns false for out-of-range fields or a repeat
    /// open of the same campaign.
    pub fn record(&self, record: OpenHistoryRecord) -> bool {
        if record.hour_of_day > 23 || record.day_of_week > 6 {
            warn!(
                subscriber_id = %record.subscriber_id,
                hour = record.hour_of_day,
                day = record.day_of_week,
                "Rejecting open record with out-of-range time fields"
            );
            return false;
        }

        let mut entry = self.by_subscriber.entry(record.subscriber_id).or_default();
        if entry.iter().any(|r| r.campaign_id == record.campaign_id) {
            debug!(
                subscriber_id = %record.subscriber_id,
                campaign_id = %record.campaign_id,
                "Repeat open ignored"
            );
            return false;
        }

        {
            let mut totals = self.totals.lock();
            totals.hours[record.hour_of_day as usize] += 1;
            totals.days[record.day_of_week as usize] += 1;
        }
        entry.push(record);
        true
    }

    /// Up to `limit` records for the subscriber, newest first.
    pub fn recent_for(&self, subscriber_id: &Uuid, limit: usize) -> Vec<OpenHistoryRecord> {
        let Some(records) = self.by_subscriber.get(subscriber_id) else {
            return Vec::new();
        };
        let mut records = records.value().clone();
        records.sort_by(|a, b| b.opened_at.cmp(&a.opened_at));
        records.truncate(limit);
        records
    }

    /// Opens per hour of day across all subscribers.
    pub fn hour_counts(&self) -> [u64; 24] {
        self.totals.lock().hours
    }

    /// Opens per day of week (0 = Sunday) across all subscribers.
    pub fn day_counts(&self) -> [u64; 7] {
        self.totals.lock().days
    }

    pub fn len(&self) -> usize {
        self.by_subscriber.iter().map(|r| r.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
