//! Scheduled campaign dispatch: lifecycle transitions for scheduled
//! campaigns and the fixed-cadence tick that sends the due ones.

pub mod scheduler;
pub mod sender;
pub mod store;

pub use scheduler::{CampaignScheduler, TickReport};
pub use sender::{CampaignSender, SendOutcome};
pub use store::{CampaignStore, InMemoryCampaignStore};
