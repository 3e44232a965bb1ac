use thiserror::Error;
use uuid::Uuid;

use crate::types::CampaignStatus;

pub type CampaignResult<T> = Result<T, CampaignError>;

#[derive(Error, Debug)]
pub enum CampaignError {
    #[error("Campaign {0} not found")]
    NotFound(Uuid),

    #[error("Campaign {id} is {actual}, expected {expected}")]
    InvalidState {
        id: Uuid,
        expected: CampaignStatus,
        actual: CampaignStatus,
    },

    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),

    #[error("Queue error: {0}")]
    Queue(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<config::ConfigError> for CampaignError {
    fn from(err: config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}
