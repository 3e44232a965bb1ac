//! Campaign persistence used by the scheduler.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use uuid::Uuid;

use campaign_core::error::{CampaignError, CampaignResult};
use campaign_core::types::{Campaign, CampaignStatus};

/// Storage seam for campaigns. `update` must apply the mutation atomically
/// with respect to other `update` calls on the same id; the scheduler relies
/// on that to claim a campaign for sending exactly once.
pub trait CampaignStore: Send + Sync {
    fn insert(&self, campaign: Campaign);

    fn get(&self, id: &Uuid) -> Option<Campaign>;

    /// Runs `apply` against the stored campaign and persists the result when
    /// it returns `Ok`. An `Err` leaves the stored campaign untouched.
    fn update(
        &self,
        id: &Uuid,
        apply: &mut dyn FnMut(&mut Campaign) -> CampaignResult<()>,
    ) -> CampaignResult<Campaign>;

    /// Scheduled campaigns with `scheduled_at <= now`, earliest first.
    fn due_scheduled(&self, now: DateTime<Utc>) -> Vec<Campaign>;

    fn with_status(&self, status: CampaignStatus) -> Vec<Campaign>;
}

/// DashMap-backed store; shard locks make `update` atomic per campaign.
#[derive(Default)]
pub struct InMemoryCampaignStore {
    campaigns: DashMap<Uuid, Campaign>,
}

impl InMemoryCampaignStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.campaigns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.campaigns.is_empty()
    }
}

impl CampaignStore for InMemoryCampaignStore {
    fn insert(&self, campaign: Campaign) {
        self.campaigns.insert(campaign.id, campaign);
    }

    fn get(&self, id: &Uuid) -> Option<Campaign> {
        self.campaigns.get(id).map(|r| r.clone())
    }

    fn update(
        &self,
        id: &Uuid,
        apply: &mut dyn FnMut(&mut Campaign) -> CampaignResult<()>,
    ) -> CampaignResult<Campaign> {
        let mut entry = self
            .campaigns
            .get_mut(id)
            .ok_or(CampaignError::NotFound(*id))?;

        let mut draft = entry.clone();
        apply(&mut draft)?;
        draft.updated_at = Utc::now();
        *entry = draft.clone();
        Ok(draft)
    }

    fn due_scheduled(&self, now: DateTime<Utc>) -> Vec<Campaign> {
        let mut due: Vec<Campaign> = self
            .campaigns
            .iter()
            .filter(|r| r.is_due(now))
            .map(|r| r.value().clone())
            .collect();
        due.sort_by_key(|c| c.scheduled_at);
        due
    }

    fn with_status(&self, status: CampaignStatus) -> Vec<Campaign> {
        self.campaigns
            .iter()
            .filter(|r| r.status == status)
            .map(|r| r.value().clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_update_rolls_back_on_error() {
        let store = InMemoryCampaignStore::new();
        let campaign = Campaign::draft("Launch", "Hi", 5);
        let id = campaign.id;
        store.insert(campaign);

        let result = store.update(&id, &mut |c| {
            c.name = "Changed".into();
            Err(CampaignError::InvalidSchedule("nope".into()))
        });
        assert!(result.is_err());
        assert_eq!(store.get(&id).unwrap().name, "Launch");
    }

    #[test]
    fn test_update_unknown_id() {
        let store = InMemoryCampaignStore::new();
        let err = store.update(&Uuid::new_v4(), &mut |_| Ok(())).unwrap_err();
        assert!(matches!(err, CampaignError::NotFound(_)));
    }

    #[test]
    fn test_due_scheduled_sorted_and_filtered() {
        let store = InMemoryCampaignStore::new();
        let now = Utc::now();

        let mut later = Campaign::draft("Later", "s", 1);
        later.status = CampaignStatus::Scheduled;
        later.scheduled_at = Some(now - Duration::minutes(1));

        let mut earlier = Campaign::draft("Earlier", "s", 1);
        earlier.status = CampaignStatus::Scheduled;
        earlier.scheduled_at = Some(now - Duration::minutes(10));

        let mut future = Campaign::draft("Future", "s", 1);
        future.status = CampaignStatus::Scheduled;
        future.scheduled_at = Some(now + Duration::minutes(10));

        let mut draft = Campaign::draft("Draft", "s", 1);
        draft.scheduled_at = Some(now - Duration::minutes(30));

        for c in [later, earlier, future, draft] {
            store.insert(c);
        }

        let due = store.due_scheduled(now);
        let names: Vec<_> = due.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["Earlier", "Later"]);
        assert_eq!(store.with_status(CampaignStatus::Scheduled).len(), 3);
    }
}
