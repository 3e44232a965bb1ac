//! Unified event bus: trait for emitting lifecycle events from any module.
//!
//! Services accept an `Arc<dyn EventSink>` and emit campaign, queue and
//! tracking events into it.

use crate::types::{AnalyticsEvent, EventType};
use chrono::Utc;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// Trait for emitting lifecycle events.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: AnalyticsEvent);
}

/// No-op sink for tests and modules that don't need event emission.
pub struct NoOpSink;

impl EventSink for NoOpSink {
    fn emit(&self, _event: AnalyticsEvent) {}
}

/// Sink that forwards every event to `tracing` at debug level.
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: AnalyticsEvent) {
        tracing::debug!(
            event_type = ?event.event_type,
            campaign_id = ?event.campaign_id,
            subject_id = ?event.subject_id,
            detail = %event.detail,
            "event"
        );
    }
}

/// In-memory sink that captures events for testing.
#[derive(Default)]
pub struct CaptureSink {
    events: Mutex<Vec<AnalyticsEvent>>,
}

impl CaptureSink {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn events(&self) -> Vec<AnalyticsEvent> {
        self.events.lock().expect("event bus mutex poisoned").clone()
    }

    pub fn count(&self) -> usize {
        self.events.lock().expect("event bus mutex poisoned").len()
    }

    pub fn count_type(&self, event_type: EventType) -> usize {
        self.events
            .lock()
            .expect("event bus mutex poisoned")
            .iter()
            .filter(|e| e.event_type == event_type)
            .count()
    }

    pub fn clear(&self) {
        self.events.lock().expect("event bus mutex poisoned").clear();
    }
}

impl EventSink for CaptureSink {
    fn emit(&self, event: AnalyticsEvent) {
        self.events.lock().expect("event bus mutex poisoned").push(event);
    }
}

/// Convenience builder for creating `AnalyticsEvent` with minimal boilerplate.
pub fn make_event(
    event_type: EventType,
    campaign_id: Option<Uuid>,
    subject_id: Option<String>,
    detail: serde_json::Value,
) -> AnalyticsEvent {
    AnalyticsEvent {
        event_id: Uuid::new_v4(),
        event_type,
        campaign_id,
        subject_id,
        node_id: "local".into(),
        detail,
        timestamp: Utc::now(),
    }
}

/// Convenience: create a no-op event bus for modules that don't need it.
pub fn noop_sink() -> Arc<dyn EventSink> {
    Arc::new(NoOpSink)
}

/// Convenience: create a capture sink for tests.
pub fn capture_sink() -> Arc<CaptureSink> {
    Arc::new(CaptureSink::new())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_sink() {
        let sink = capture_sink();
        assert_eq!(sink.count(), 0);

        let campaign_id = Uuid::new_v4();
        sink.emit(make_event(
            EventType::CampaignScheduled,
            Some(campaign_id),
            None,
            serde_json::json!({}),
        ));
        sink.emit(make_event(
            EventType::JobQueued,
            None,
            Some("job-1".into()),
            serde_json::json!({"queue": "import"}),
        ));

        assert_eq!(sink.count(), 2);
        assert_eq!(sink.count_type(EventType::CampaignScheduled), 1);
        assert_eq!(sink.count_type(EventType::JobQueued), 1);

        let events = sink.events();
        assert_eq!(events[0].campaign_id, Some(campaign_id));
        assert_eq!(events[1].subject_id, Some("job-1".into()));

        sink.clear();
        assert_eq!(sink.count(), 0);
    }

    #[test]
    fn test_noop_sink() {
        let sink = noop_sink();
        // Should not panic
        sink.emit(make_event(EventType::EmailOpened, None, None, serde_json::Value::Null));
    }
}
