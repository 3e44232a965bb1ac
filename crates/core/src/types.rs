use chrono::{DateTime, Datelike, FixedOffset, Timelike, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status of an email campaign.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum CampaignStatus {
    Draft,
    Scheduled,
    Sending,
    Sent,
    Failed,
}

impl CampaignStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Scheduled => "scheduled",
            Self::Sending => "sending",
            Self::Sent => "sent",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for CampaignStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An email-marketing send unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Campaign {
    pub id: Uuid,
    pub name: String,
    pub subject: String,
    pub status: CampaignStatus,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub sent_at: Option<DateTime<Utc>>,
    pub total_recipients: u64,
    pub sent_count: u64,
    /// Free-form JSON bag; dispatch failures land under `error` / `failed_at`.
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Campaign {
    /// New campaign in `draft`.
    pub fn draft(
        name: impl Into<String>,
        subject: impl Into<String>,
        total_recipients: u64,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            subject: subject.into(),
            status: CampaignStatus::Draft,
            scheduled_at: None,
            sent_at: None,
            total_recipients,
            sent_count: 0,
            metadata: serde_json::json!({}),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == CampaignStatus::Scheduled
            && self.scheduled_at.map(|at| at <= now).unwrap_or(false)
    }

    /// Merges `key = value` into the metadata object, replacing a non-object bag.
    pub fn set_metadata(&mut self, key: &str, value: serde_json::Value) {
        if !self.metadata.is_object() {
            self.metadata = serde_json::json!({});
        }
        if let Some(map) = self.metadata.as_object_mut() {
            map.insert(key.to_string(), value);
        }
    }
}

/// One tracked email open, used for send-time statistics.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OpenHistoryRecord {
    pub id: Uuid,
    pub subscriber_id: Uuid,
    pub campaign_id: Uuid,
    pub opened_at: DateTime<Utc>,
    /// 0-23 in the recipient's offset.
    pub hour_of_day: u32,
    /// 0 = Sunday .. 6 = Saturday in the recipient's offset.
    pub day_of_week: u32,
    pub timezone: String,
}

impl OpenHistoryRecord {
    pub fn from_open(
        subscriber_id: Uuid,
        campaign_id: Uuid,
        opened_at: DateTime<FixedOffset>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            subscriber_id,
            campaign_id,
            opened_at: opened_at.with_timezone(&Utc),
            hour_of_day: opened_at.hour(),
            day_of_week: opened_at.weekday().num_days_from_sunday(),
            timezone: opened_at.offset().to_string(),
        }
    }
}

/// Lifecycle event routed through the event bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyticsEvent {
    pub event_id: Uuid,
    pub event_type: EventType,
    pub campaign_id: Option<Uuid>,
    /// Job id, subscriber id or other subject of the event.
    pub subject_id: Option<String>,
    pub node_id: String,
    #[serde(default)]
    pub detail: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    // Campaign lifecycle
    CampaignScheduled,
    CampaignCancelled,
    CampaignRescheduled,
    CampaignSent,
    CampaignFailed,
    // Queue
    JobQueued,
    JobCompleted,
    JobFailed,
    // Tracking
    EmailOpened,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_open_record_uses_local_offset() {
        let offset = FixedOffset::east_opt(2 * 3600).unwrap();
        // Sunday 2024-03-03 23:30 UTC is Monday 01:30 at +02:00
        let opened = offset.with_ymd_and_hms(2024, 3, 4, 1, 30, 0).unwrap();
        let record = OpenHistoryRecord::from_open(Uuid::new_v4(), Uuid::new_v4(), opened);

        assert_eq!(record.hour_of_day, 1);
        assert_eq!(record.day_of_week, 1);
        assert_eq!(record.timezone, "+02:00");
        assert_eq!(record.opened_at, Utc.with_ymd_and_hms(2024, 3, 3, 23, 30, 0).unwrap());
    }

    #[test]
    fn test_campaign_due_only_when_scheduled() {
        let mut campaign = Campaign::draft("Spring", "Hello", 10);
        let now = Utc::now();
        campaign.scheduled_at = Some(now - chrono::Duration::minutes(1));
        assert!(!campaign.is_due(now));

        campaign.status = CampaignStatus::Scheduled;
        assert!(campaign.is_due(now));
        assert!(!campaign.is_due(now - chrono::Duration::minutes(5)));
    }

    #[test]
    fn test_set_metadata_replaces_non_object() {
        let mut campaign = Campaign::draft("Spring", "Hello", 10);
        campaign.metadata = serde_json::Value::Null;
        campaign.set_metadata("error", serde_json::json!("smtp down"));
        assert_eq!(campaign.metadata["error"], "smtp down");
    }

    #[test]
    fn test_status_serializes_lowercase() {
        let json = serde_json::to_string(&CampaignStatus::Scheduled).unwrap();
        assert_eq!(json, "\"scheduled\"");
    }
}
