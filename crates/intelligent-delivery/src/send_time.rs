//! Send-time optimization: predicts the best hour and weekday to reach a
//! subscriber from their open history.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Datelike, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use campaign_core::config::SendTimeConfig;

use crate::history::OpenHistory;

/// Used when there is no open history at all: Tuesday, 10:00.
pub const DEFAULT_HOUR: u32 = 10;
pub const DEFAULT_DAY: u32 = 2;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OptimizationMethod {
    PersonalOptimal,
    GlobalBest,
    Fallback,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SendTimeEstimate {
    pub subscriber_id: Uuid,
    pub optimal_hour: u32,
    /// 0 = Sunday .. 6 = Saturday.
    pub optimal_day: u32,
    pub confidence: f64,
    pub data_points: usize,
    pub method: OptimizationMethod,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CampaignSendTime {
    pub optimal_hour: u32,
    pub optimal_day: u32,
    pub confidence: f64,
    pub subscribers: usize,
    pub data_points: usize,
    pub method: OptimizationMethod,
    pub next_send_at: DateTime<Utc>,
}

pub struct SendTimeOptimizer {
    history: Arc<OpenHistory>,
    config: SendTimeConfig,
}

impl SendTimeOptimizer {
    pub fn new(history: Arc<OpenHistory>, config: SendTimeConfig) -> Self {
        Self { history, config }
    }

    pub fn history(&self) -> &Arc<OpenHistory> {
        &self.history
    }

    /// Mode of the subscriber's recent open hours and weekdays, or the global
    /// mode with a fixed low confidence when there are too few data points.
    pub fn optimal_time_for_subscriber(&self, subscriber_id: &Uuid) -> SendTimeEstimate {
        let records = self
            .history
            .recent_for(subscriber_id, self.config.history_limit);
        let data_points = records.len();

        if data_points < self.config.min_data_points.max(1) {
            return self.fallback_estimate(*subscriber_id, data_points);
        }

        let hour = mode(records.iter().map(|r| r.hour_of_day))
            .map(|(h, _)| h)
            .unwrap_or(DEFAULT_HOUR);
        let day = mode(records.iter().map(|r| r.day_of_week))
            .map(|(d, _)| d)
            .unwrap_or(DEFAULT_DAY);
        let full = self.config.full_confidence_points.max(1) as f64;
        let confidence = round2((data_points as f64 / full).min(1.0));

        SendTimeEstimate {
            subscriber_id: *subscriber_id,
            optimal_hour: hour,
            optimal_day: day,
            confidence,
            data_points,
            method: OptimizationMethod::PersonalOptimal,
        }
    }

    /// Data-point-weighted average of the recipients' estimates and the next
    /// time that hour/weekday comes around after `now`.
    pub fn optimal_time_for_campaign(
        &self,
        subscribers: &[Uuid],
        now: DateTime<Utc>,
    ) -> CampaignSendTime {
        let estimates: Vec<SendTimeEstimate> = subscribers
            .iter()
            .map(|id| self.optimal_time_for_subscriber(id))
            .collect();
        let data_points: usize = estimates.iter().map(|e| e.data_points).sum();

        let weighted = |f: fn(&SendTimeEstimate) -> f64| {
            let pairs: Vec<(f64, f64)> = estimates
                .iter()
                .map(|e| (f(e), e.data_points as f64))
                .collect();
            weighted_average(&pairs)
        };

        let aggregate = (
            weighted(|e| e.optimal_hour as f64),
            weighted(|e| e.optimal_day as f64),
            weighted(|e| e.confidence),
        );

        let personal = estimates
            .iter()
            .any(|e| e.method == OptimizationMethod::PersonalOptimal);
        let (hour, day, confidence, method) = match aggregate {
            (Some(hour), Some(day), Some(confidence)) => (
                (hour.round() as u32).min(23),
                (day.round() as u32).min(6),
                round2(confidence),
                if personal {
                    OptimizationMethod::PersonalOptimal
                } else {
                    OptimizationMethod::GlobalBest
                },
            ),
            _ => {
                let fallback = self.fallback_estimate(Uuid::nil(), 0);
                (
                    fallback.optimal_hour,
                    fallback.optimal_day,
                    fallback.confidence,
                    fallback.method,
                )
            }
        };

        debug!(
            subscribers = subscribers.len(),
            data_points,
            hour,
            day,
            confidence,
            "Computed campaign send time"
        );

        CampaignSendTime {
            optimal_hour: hour,
            optimal_day: day,
            confidence,
            subscribers: subscribers.len(),
            data_points,
            method,
            next_send_at: next_occurrence(&now, hour, day),
        }
    }

    /// Most frequent open hour and weekday across all subscribers.
    pub fn global_optimal_time(&self) -> Option<(u32, u32)> {
        let hour = mode_of_counts(&self.history.hour_counts())?;
        let day = mode_of_counts(&self.history.day_counts())?;
        Some((hour, day))
    }

    /// Busiest open hours across all subscribers, busiest first.
    pub fn top_open_hours(&self, limit: usize) -> Vec<(u32, u64)> {
        let mut hours: Vec<(u32, u64)> = self
            .history
            .hour_counts()
            .iter()
            .enumerate()
            .filter(|(_, count)| **count > 0)
            .map(|(hour, count)| (hour as u32, *count))
            .collect();
        hours.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        hours.truncate(limit);
        hours
    }

    fn fallback_estimate(&self, subscriber_id: Uuid, data_points: usize) -> SendTimeEstimate {
        match self.global_optimal_time() {
            Some((hour, day)) => SendTimeEstimate {
                subscriber_id,
                optimal_hour: hour,
                optimal_day: day,
                confidence: self.config.fallback_confidence,
                data_points,
                method: OptimizationMethod::GlobalBest,
            },
            None => SendTimeEstimate {
                subscriber_id,
                optimal_hour: DEFAULT_HOUR,
                optimal_day: DEFAULT_DAY,
                confidence: 0.0,
                data_points,
                method: OptimizationMethod::Fallback,
            },
        }
    }
}

/// Most frequent value and its count; ties go to the smallest value.
pub fn mode<I>(values: I) -> Option<(u32, usize)>
where
    I: IntoIterator<Item = u32>,
{
    let mut counts: BTreeMap<u32, usize> = BTreeMap::new();
    for value in values {
        *counts.entry(value).or_insert(0) += 1;
    }
    counts
        .into_iter()
        .fold(None, |best: Option<(u32, usize)>, (value, count)| match best {
            Some((_, best_count)) if best_count >= count => best,
            _ => Some((value, count)),
        })
}

/// Index of the largest bucket; ties go to the lowest index, all-zero is `None`.
pub fn mode_of_counts(counts: &[u64]) -> Option<u32> {
    counts
        .iter()
        .enumerate()
        .filter(|(_, c)| **c > 0)
        .fold(None, |best: Option<(usize, u64)>, (i, &c)| match best {
            Some((_, best_count)) if best_count >= c => best,
            _ => Some((i, c)),
        })
        .map(|(i, _)| i as u32)
}

/// `sum(value * weight) / sum(weight)`, or `None` when the total weight is not positive.
pub fn weighted_average(pairs: &[(f64, f64)]) -> Option<f64> {
    let total_weight: f64 = pairs.iter().map(|(_, w)| w).sum();
    if total_weight <= 0.0 {
        return None;
    }
    Some(pairs.iter().map(|(v, w)| v * w).sum::<f64>() / total_weight)
}

/// First `hour:00` on weekday `day_of_week` (0 = Sunday) strictly after
/// `now`, in `now`'s timezone.
pub fn next_occurrence<Tz: TimeZone>(
    now: &DateTime<Tz>,
    hour: u32,
    day_of_week: u32,
) -> DateTime<Tz> {
    let hour = hour.min(23);
    let day = day_of_week % 7;

    let local = now.naive_local();
    let today = local.date();
    let current = today.weekday().num_days_from_sunday();
    let days_ahead = (day + 7 - current) % 7;

    let target = today + chrono::Duration::days(days_ahead as i64);
    let Some(mut candidate) = target.and_hms_opt(hour, 0, 0) else {
        return now.clone();
    };
    if candidate <= local {
        candidate += chrono::Duration::days(7);
    }

    now.timezone()
        .from_local_datetime(&candidate)
        .earliest()
        .unwrap_or_else(|| now.clone() + (candidate - local))
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
