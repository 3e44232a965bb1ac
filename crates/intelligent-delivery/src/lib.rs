//! Intelligent delivery: open history and send-time optimization.

pub mod history;
pub mod send_time;

pub use history::OpenHistory;
pub use send_time::{CampaignSendTime, OptimizationMethod, SendTimeEstimate, SendTimeOptimizer};
