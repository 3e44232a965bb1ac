use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use campaign_core::types::Campaign;

/// Result of handing a campaign to the delivery pipeline.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SendOutcome {
    pub recipients: u64,
    pub sent: u64,
}

/// Delivers a campaign to its recipients. Errors are recorded verbatim on
/// the campaign's metadata; partial sends are not rolled back.
#[async_trait]
pub trait CampaignSender: Send + Sync {
    async fn send_campaign(&self, campaign: &Campaign) -> anyhow::Result<SendOutcome>;
}
