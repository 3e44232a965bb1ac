//! In-process job queue: priorities, delayed retries with backoff, retention
//! and pause/resume. Jobs move through
//! `waiting | delayed -> active -> completed | failed`, with failed attempts
//! going back to `delayed` while attempts remain.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::futures::Notified;
use tokio::sync::Notify;
use tracing::debug;
use uuid::Uuid;

use campaign_core::config::QueueJobConfig;
use campaign_core::error::{CampaignError, CampaignResult};

/// Upper bound on any retry backoff or initial job delay.
pub const MAX_DELAY: Duration = Duration::from_secs(7 * 24 * 3600);

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Waiting,
    Delayed,
    Active,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Backoff {
    Fixed { delay_ms: u64 },
    Exponential { delay_ms: u64 },
}

impl Backoff {
    /// Delay before the retry that follows failed attempt number `attempt`
    /// (1-based), capped at [`MAX_DELAY`].
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let delay = match *self {
            Backoff::Fixed { delay_ms } => Duration::from_millis(delay_ms),
            Backoff::Exponential { delay_ms } => {
                let factor = 1u64.checked_shl(attempt.saturating_sub(1)).unwrap_or(u64::MAX);
                Duration::from_millis(delay_ms.saturating_mul(factor))
            }
        };
        delay.min(MAX_DELAY)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobOptions {
    /// Lower runs first; equal priorities run in insertion order.
    pub priority: u32,
    pub attempts: u32,
    pub backoff: Backoff,
    /// Initial delay before the job becomes runnable.
    pub delay_ms: u64,
    /// Keep only the newest N completed jobs.
    pub remove_on_complete: Option<usize>,
    /// Keep only the newest N failed jobs.
    pub remove_on_fail: Option<usize>,
    pub timeout_ms: Option<u64>,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            priority: 0,
            attempts: 1,
            backoff: Backoff::Fixed { delay_ms: 0 },
            delay_ms: 0,
            remove_on_complete: None,
            remove_on_fail: None,
            timeout_ms: None,
        }
    }
}

impl From<&QueueJobConfig> for JobOptions {
    fn from(config: &QueueJobConfig) -> Self {
        Self {
            priority: config.priority,
            attempts: config.attempts.max(1),
            backoff: Backoff::Exponential {
                delay_ms: config.backoff_ms,
            },
            delay_ms: 0,
            remove_on_complete: config.remove_on_complete,
            remove_on_fail: config.remove_on_fail,
            timeout_ms: config.timeout_ms,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub name: String,
    pub payload: serde_json::Value,
    pub options: JobOptions,
    pub state: JobState,
    /// Attempts started so far.
    pub attempts_made: u32,
    pub failed_reason: Option<String>,
    pub return_value: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub available_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    seq: u64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueueCounts {
    pub waiting: usize,
    pub delayed: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
    pub paused: bool,
}

#[derive(Default)]
struct QueueState {
    jobs: HashMap<Uuid, Job>,
    waiting: BTreeSet<(u32, u64, Uuid)>,
    delayed: BTreeSet<(DateTime<Utc>, u64, Uuid)>,
    completed: VecDeque<Uuid>,
    failed: VecDeque<Uuid>,
    active: usize,
    next_seq: u64,
}

impl QueueState {
    fn enqueue(&mut self, id: Uuid, now: DateTime<Utc>) {
        let Some(job) = self.jobs.get_mut(&id) else {
            return;
        };
        if job.available_at > now {
            job.state = JobState::Delayed;
            self.delayed.insert((job.available_at, job.seq, id));
        } else {
            job.state = JobState::Waiting;
            self.waiting.insert((job.options.priority, job.seq, id));
        }
    }

    fn promote_due(&mut self, now: DateTime<Utc>) {
        while let Some(&(at, seq, id)) = self.delayed.first() {
            if at > now {
                break;
            }
            self.delayed.remove(&(at, seq, id));
            if let Some(job) = self.jobs.get_mut(&id) {
                job.state = JobState::Waiting;
                self.waiting.insert((job.options.priority, seq, id));
            }
        }
    }

    fn detach(&mut self, job: &Job) {
        match job.state {
            JobState::Waiting => {
                self.waiting.remove(&(job.options.priority, job.seq, job.id));
            }
            JobState::Delayed => {
                self.delayed.remove(&(job.available_at, job.seq, job.id));
            }
            JobState::Completed => self.completed.retain(|id| *id != job.id),
            JobState::Failed => self.failed.retain(|id| *id != job.id),
            JobState::Active => {}
        }
    }

    fn retain_newest(
        list: &mut VecDeque<Uuid>,
        jobs: &mut HashMap<Uuid, Job>,
        keep: Option<usize>,
    ) {
        if let Some(keep) = keep {
            while list.len() > keep {
                if let Some(id) = list.pop_front() {
                    jobs.remove(&id);
                }
            }
        }
    }
}

/// A named queue of jobs shared between producers and `QueueWorker`s.
pub struct JobQueue {
    name: String,
    state: Mutex<QueueState>,
    paused: AtomicBool,
    notify: Notify,
}

impl std::fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobQueue")
            .field("name", &self.name)
            .field("counts", &self.counts())
            .finish()
    }
}

impl JobQueue {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(QueueState::default()),
            paused: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn add(
        &self,
        name: impl Into<String>,
        payload: serde_json::Value,
        options: JobOptions,
    ) -> Job {
        let now = Utc::now();
        let available_at = available_after(now, Duration::from_millis(options.delay_ms));
        let job = {
            let mut state = self.state.lock();
            let seq = state.next_seq;
            state.next_seq += 1;

            let job = Job {
                id: Uuid::new_v4(),
                name: name.into(),
                payload,
                options,
                state: JobState::Waiting,
                attempts_made: 0,
                failed_reason: None,
                return_value: None,
                created_at: now,
                available_at,
                processed_at: None,
                finished_at: None,
                seq,
            };
            state.jobs.insert(job.id, job.clone());
            state.enqueue(job.id, now);
            Job {
                state: if available_at > now {
                    JobState::Delayed
                } else {
                    JobState::Waiting
                },
                ..job
            }
        };

        metrics::counter!("queue.jobs_added").increment(1);
        debug!(queue = %self.name, job_id = %job.id, name = %job.name, "Job added");
        self.notify.notify_one();
        job
    }

    /// Claims the highest-priority runnable job, or `None` when the queue is
    /// paused or nothing is due.
    pub fn take_next(&self, now: DateTime<Utc>) -> Option<Job> {
        if self.is_paused() {
            return None;
        }
        let mut state = self.state.lock();
        state.promote_due(now);

        let key = state.waiting.pop_first()?;
        let job = state.jobs.get_mut(&key.2)?;
        job.state = JobState::Active;
        job.attempts_made += 1;
        job.processed_at = Some(now);
        let job = job.clone();
        state.active += 1;
        Some(job)
    }

    pub fn complete(
        &self,
        id: &Uuid,
        return_value: serde_json::Value,
        now: DateTime<Utc>,
    ) -> CampaignResult<Job> {
        let mut state = self.state.lock();
        let job = Self::active_job(&mut state, id)?;
        job.state = JobState::Completed;
        job.return_value = Some(return_value);
        job.finished_at = Some(now);
        let keep = job.options.remove_on_complete;
        let snapshot = job.clone();

        state.active = state.active.saturating_sub(1);
        state.completed.push_back(*id);
        let QueueState { completed, jobs, .. } = &mut *state;
        QueueState::retain_newest(completed, jobs, keep);
        Ok(snapshot)
    }

    /// Records a failed attempt. Returns `Delayed` when the job will be
    /// retried after its backoff, `Failed` when attempts are exhausted.
    pub fn fail(&self, id: &Uuid, reason: &str, now: DateTime<Utc>) -> CampaignResult<JobState> {
        let retry = {
            let mut state = self.state.lock();
            let job = Self::active_job(&mut state, id)?;
            job.failed_reason = Some(reason.to_string());
            state.active = state.active.saturating_sub(1);

            let job = state
                .jobs
                .get_mut(id)
                .ok_or_else(|| CampaignError::Queue(format!("job {} vanished", id)))?;
            if job.attempts_made < job.options.attempts {
                let delay = job.options.backoff.delay_for(job.attempts_made);
                job.available_at = available_after(now, delay);
                state.enqueue(*id, now);
                true
            } else {
                job.state = JobState::Failed;
                job.finished_at = Some(now);
                let keep = job.options.remove_on_fail;
                state.failed.push_back(*id);
                let QueueState { failed, jobs, .. } = &mut *state;
                QueueState::retain_newest(failed, jobs, keep);
                false
            }
        };

        if retry {
            self.notify.notify_one();
            Ok(self.get(id).map(|j| j.state).unwrap_or(JobState::Delayed))
        } else {
            Ok(JobState::Failed)
        }
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
        debug!(queue = %self.name, "Queue paused");
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        self.notify.notify_waiters();
        debug!(queue = %self.name, "Queue resumed");
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn counts(&self) -> QueueCounts {
        let state = self.state.lock();
        QueueCounts {
            waiting: state.waiting.len(),
            delayed: state.delayed.len(),
            active: state.active,
            completed: state.completed.len(),
            failed: state.failed.len(),
            paused: self.is_paused(),
        }
    }

    pub fn get(&self, id: &Uuid) -> Option<Job> {
        self.state.lock().jobs.get(id).cloned()
    }

    /// Jobs currently in `state`, oldest first.
    pub fn jobs(&self, state: JobState) -> Vec<Job> {
        let guard = self.state.lock();
        let mut jobs: Vec<Job> = guard
            .jobs
            .values()
            .filter(|j| j.state == state)
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.seq);
        jobs
    }

    /// Removes a job that is not currently running.
    pub fn remove(&self, id: &Uuid) -> bool {
        let mut state = self.state.lock();
        let Some(job) = state.jobs.get(id).cloned() else {
            return false;
        };
        if job.state == JobState::Active {
            return false;
        }
        state.detach(&job);
        state.jobs.remove(id);
        true
    }

    /// Drops `Completed` or `Failed` jobs that finished at least `grace` ago.
    pub fn clean(&self, grace: Duration, target: JobState, now: DateTime<Utc>) -> usize {
        if !matches!(target, JobState::Completed | JobState::Failed) {
            return 0;
        }
        let grace = chrono::Duration::from_std(grace).unwrap_or_else(|_| chrono::Duration::zero());
        let cutoff = now - grace;

        let mut state = self.state.lock();
        let stale: Vec<Job> = state
            .jobs
            .values()
            .filter(|j| j.state == target && j.finished_at.map(|at| at <= cutoff).unwrap_or(false))
            .cloned()
            .collect();

        for job in &stale {
            state.detach(job);
            state.jobs.remove(&job.id);
        }
        stale.len()
    }

    /// Resolves when a job is added, retried or the queue is resumed.
    pub fn notified(&self) -> Notified<'_> {
        self.notify.notified()
    }

    fn active_job<'a>(state: &'a mut QueueState, id: &Uuid) -> CampaignResult<&'a mut Job> {
        let job = state
            .jobs
            .get_mut(id)
            .ok_or_else(|| CampaignError::Queue(format!("job {} not found", id)))?;
        if job.state != JobState::Active {
            return Err(CampaignError::Queue(format!(
                "job {} is {:?}, expected active",
                id, job.state
            )));
        }
        Ok(job)
    }
}

/// `now + delay` with the delay capped at [`MAX_DELAY`]; never panics.
fn available_after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    let cap = chrono::Duration::seconds(MAX_DELAY.as_secs() as i64);
    let delay = chrono::Duration::from_std(delay.min(MAX_DELAY)).unwrap_or(cap);
    now.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn retrying(attempts: u32, delay_ms: u64) -> JobOptions {
        JobOptions {
            attempts,
            backoff: Backoff::Exponential { delay_ms },
            ..JobOptions::default()
        }
    }

    #[test]
    fn test_exponential_backoff() {
        let backoff = Backoff::Exponential { delay_ms: 2000 };
        assert_eq!(backoff.delay_for(1), Duration::from_millis(2000));
        assert_eq!(backoff.delay_for(2), Duration::from_millis(4000));
        assert_eq!(backoff.delay_for(3), Duration::from_millis(8000));
        assert_eq!(Backoff::Fixed { delay_ms: 50 }.delay_for(5), Duration::from_millis(50));
    }

    #[test]
    fn test_backoff_is_capped() {
        let backoff = Backoff::Exponential { delay_ms: 2000 };
        assert_eq!(backoff.delay_for(42), MAX_DELAY);
        assert_eq!(backoff.delay_for(u32::MAX), MAX_DELAY);
        assert_eq!(Backoff::Fixed { delay_ms: u64::MAX }.delay_for(1), MAX_DELAY);
    }

    #[test]
    fn test_many_attempts_never_overflow_retry_time() {
        let queue = JobQueue::new("import");
        let job = queue.add("process-import", json!({}), retrying(60, 2000));
        let cap = chrono::Duration::seconds(MAX_DELAY.as_secs() as i64);

        let mut now = Utc::now();
        for attempt in 1..60 {
            let taken = queue.take_next(now).unwrap();
            assert_eq!(taken.attempts_made, attempt);
            assert_eq!(queue.fail(&job.id, "smtp down", now).unwrap(), JobState::Delayed);

            let retry_at = queue.get(&job.id).unwrap().available_at;
            assert!(retry_at > now);
            assert!(retry_at - now <= cap);
            now = retry_at;
        }

        queue.take_next(now).unwrap();
        assert_eq!(queue.fail(&job.id, "smtp down", now).unwrap(), JobState::Failed);
    }

    #[test]
    fn test_huge_initial_delay_is_capped() {
        let queue = JobQueue::new("import");
        let options = JobOptions {
            delay_ms: u64::MAX,
            ..JobOptions::default()
        };
        let job = queue.add("process-import", json!({}), options);

        assert_eq!(job.state, JobState::Delayed);
        assert_eq!(
            job.available_at,
            job.created_at + chrono::Duration::seconds(MAX_DELAY.as_secs() as i64)
        );
        assert_eq!(queue.counts().delayed, 1);
    }

    #[test]
    fn test_priority_then_fifo() {
        let queue = JobQueue::new("import");
        let low = queue.add("a", json!(1), JobOptions { priority: 5, ..JobOptions::default() });
        let high_1 = queue.add("b", json!(2), JobOptions { priority: 1, ..JobOptions::default() });
        let high_2 = queue.add("c", json!(3), JobOptions { priority: 1, ..JobOptions::default() });

        let now = Utc::now();
        assert_eq!(queue.take_next(now).unwrap().id, high_1.id);
        assert_eq!(queue.take_next(now).unwrap().id, high_2.id);
        assert_eq!(queue.take_next(now).unwrap().id, low.id);
        assert!(queue.take_next(now).is_none());
        assert_eq!(queue.counts().active, 3);
    }

    #[test]
    fn test_failed_attempt_is_delayed_then_retried() {
        let queue = JobQueue::new("import");
        let job = queue.add("process-import", json!({}), retrying(3, 2000));

        let now = Utc::now();
        let taken = queue.take_next(now).unwrap();
        assert_eq!(taken.attempts_made, 1);

        assert_eq!(queue.fail(&job.id, "disk full", now).unwrap(), JobState::Delayed);
        let delayed = queue.get(&job.id).unwrap();
        assert_eq!(delayed.available_at, now + chrono::Duration::milliseconds(2000));
        assert_eq!(delayed.failed_reason.as_deref(), Some("disk full"));

        // Not runnable before the backoff elapses
        assert!(queue.take_next(now + chrono::Duration::milliseconds(1999)).is_none());

        let later = now + chrono::Duration::milliseconds(2000);
        assert_eq!(queue.take_next(later).unwrap().attempts_made, 2);
        assert_eq!(queue.fail(&job.id, "disk full", later).unwrap(), JobState::Delayed);
        assert_eq!(
            queue.get(&job.id).unwrap().available_at,
            later + chrono::Duration::milliseconds(4000)
        );

        let last = later + chrono::Duration::milliseconds(4000);
        queue.take_next(last).unwrap();
        assert_eq!(queue.fail(&job.id, "disk full", last).unwrap(), JobState::Failed);
        assert_eq!(queue.counts().failed, 1);
        assert_eq!(queue.counts().active, 0);
    }

    #[test]
    fn test_complete_applies_retention() {
        let queue = JobQueue::new("validation");
        let options = JobOptions {
            remove_on_complete: Some(2),
            ..JobOptions::default()
        };
        let ids: Vec<Uuid> = (0..4).map(|n| queue.add("v", json!(n), options.clone()).id).collect();

        let now = Utc::now();
        for _ in 0..4 {
            let job = queue.take_next(now).unwrap();
            queue.complete(&job.id, json!({"ok": true}), now).unwrap();
        }

        assert_eq!(queue.counts().completed, 2);
        assert!(queue.get(&ids[0]).is_none());
        assert!(queue.get(&ids[1]).is_none());
        assert_eq!(queue.get(&ids[3]).unwrap().return_value, Some(json!({"ok": true})));
    }

    #[test]
    fn test_complete_requires_active() {
        let queue = JobQueue::new("import");
        let job = queue.add("x", json!(null), JobOptions::default());
        assert!(queue.complete(&job.id, json!(null), Utc::now()).is_err());
        assert!(queue.fail(&Uuid::new_v4(), "x", Utc::now()).is_err());
    }

    #[test]
    fn test_pause_blocks_take() {
        let queue = JobQueue::new("import");
        queue.add("x", json!(null), JobOptions::default());
        queue.pause();
        assert!(queue.take_next(Utc::now()).is_none());
        assert!(queue.counts().paused);
        queue.resume();
        assert!(queue.take_next(Utc::now()).is_some());
    }

    #[test]
    fn test_remove_skips_active_jobs() {
        let queue = JobQueue::new("import");
        let running = queue.add("x", json!(1), JobOptions::default());
        let delayed = queue.add(
            "y",
            json!(2),
            JobOptions {
                delay_ms: 60_000,
                ..JobOptions::default()
            },
        );
        let queued = queue.add("z", json!(3), JobOptions::default());
        assert_eq!(delayed.state, JobState::Delayed);

        let taken = queue.take_next(Utc::now()).unwrap();
        assert_eq!(taken.id, running.id);

        assert!(!queue.remove(&running.id));
        assert!(queue.remove(&delayed.id));
        assert!(queue.remove(&queued.id));
        assert!(!queue.remove(&queued.id));
        assert_eq!(queue.counts().delayed, 0);
        assert_eq!(queue.counts().waiting, 0);
        assert_eq!(queue.counts().active, 1);
    }

    #[test]
    fn test_clean_only_old_finished_jobs() {
        let queue = JobQueue::new("import");
        let now = Utc::now();
        let old = queue.add("old", json!(1), JobOptions::default());
        let fresh = queue.add("fresh", json!(2), JobOptions::default());
        let pending = queue.add("pending", json!(3), JobOptions::default());

        queue.take_next(now).unwrap();
        queue.complete(&old.id, json!(null), now - chrono::Duration::hours(2)).unwrap();
        queue.take_next(now).unwrap();
        queue.complete(&fresh.id, json!(null), now).unwrap();

        assert_eq!(queue.clean(Duration::from_secs(3600), JobState::Waiting, now), 0);
        assert_eq!(queue.clean(Duration::from_secs(3600), JobState::Completed, now), 1);
        assert!(queue.get(&old.id).is_none());
        assert!(queue.get(&fresh.id).is_some());
        assert!(queue.get(&pending.id).is_some());
        assert_eq!(queue.counts().completed, 1);
    }
}
