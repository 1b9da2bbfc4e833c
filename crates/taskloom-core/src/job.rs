//! The persisted job record and its derived state.
//!
//! `Job` is a plain value type (no trait object, no handler reference) that
//! carries every persistable field from the data model plus the fluent
//! mutators callers use to build one up before saving it. Derived state is
//! computed on demand by [`derive_state`], never stored.

use std::collections::HashSet;

use chrono::{DateTime, Duration, Utc, Weekday};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::backoff::{BackoffInput, BackoffOutcome};

pub type JobId = Uuid;

/// `normal` runs once per submission; `single` keeps at most one persisted
/// record per job name (recurring schedules are stored this way).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobType {
    Normal,
    Single,
}

/// Debounce merge strategy for `uniqueOpts.debounce`, spec.md §4.4.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DebounceStrategy {
    /// Reset `nextRunAt` to `now + delay` on every save (default).
    Trailing,
    /// Leave the existing record untouched once a window is open.
    Leading,
}

impl Default for DebounceStrategy {
    fn default() -> Self {
        DebounceStrategy::Trailing
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DebounceConfig {
    pub delay_ms: i64,
    pub max_wait_ms: Option<i64>,
    pub strategy: DebounceStrategy,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UniqueOpts {
    pub insert_only: bool,
    pub debounce: Option<DebounceConfig>,
}

/// Named, commonly-used priority levels, mirroring the `JobPriority` enums
/// seen throughout the cron-scheduler family this engine belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Lowest = -10,
    Low = -5,
    Normal = 0,
    High = 10,
    Highest = 20,
}

/// Weekdays on which a job's `nextRunAt` may never fall, evaluated in the
/// job's `repeatTimezone`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkipDays(pub HashSet<u8>);

impl SkipDays {
    pub fn new(days: impl IntoIterator<Item = Weekday>) -> Self {
        Self(days.into_iter().map(weekday_index).collect())
    }

    pub fn contains(&self, day: Weekday) -> bool {
        self.0.contains(&weekday_index(day))
    }

    pub fn is_full(&self) -> bool {
        self.0.len() >= 7
    }
}

pub(crate) fn weekday_index(day: Weekday) -> u8 {
    // 0 = Sunday ... 6 = Saturday, per spec.md §3.1.
    match day {
        Weekday::Sun => 0,
        Weekday::Mon => 1,
        Weekday::Tue => 2,
        Weekday::Wed => 3,
        Weekday::Thu => 4,
        Weekday::Fri => 5,
        Weekday::Sat => 6,
    }
}

/// Derived, non-persisted state computed from the mutable timestamp fields.
/// See spec.md §3.2 rule 7.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    Running,
    Failed,
    Repeating,
    Scheduled,
    Queued,
    Completed,
}

/// A persisted job record (spec.md §3.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Option<JobId>,
    pub name: String,
    pub job_type: JobType,
    pub data: Value,
    pub priority: i32,
    pub next_run_at: Option<DateTime<Utc>>,
    pub locked_at: Option<DateTime<Utc>>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_finished_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub fail_count: u32,
    pub fail_reason: Option<String>,
    pub repeat_interval: Option<String>,
    pub repeat_timezone: Option<String>,
    pub repeat_at: Option<String>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub skip_days: SkipDays,
    pub disabled: bool,
    pub unique: Option<serde_json::Map<String, Value>>,
    pub unique_opts: Option<UniqueOpts>,
    pub debounce_started_at: Option<DateTime<Utc>>,
    pub progress: Option<u8>,
    pub last_modified_by: Option<String>,
}

impl Job {
    pub fn new(name: impl Into<String>, data: Value) -> Self {
        Self {
            id: None,
            name: name.into(),
            job_type: JobType::Normal,
            data,
            priority: Priority::Normal as i32,
            next_run_at: None,
            locked_at: None,
            last_run_at: None,
            last_finished_at: None,
            failed_at: None,
            fail_count: 0,
            fail_reason: None,
            repeat_interval: None,
            repeat_timezone: None,
            repeat_at: None,
            start_date: None,
            end_date: None,
            skip_days: SkipDays::default(),
            disabled: false,
            unique: None,
            unique_opts: None,
            debounce_started_at: None,
            progress: None,
            last_modified_by: None,
        }
    }

    pub fn priority(mut self, p: i32) -> Self {
        self.priority = p;
        self
    }

    pub fn priority_preset(mut self, p: Priority) -> Self {
        self.priority = p as i32;
        self
    }

    pub fn schedule_at(mut self, when: DateTime<Utc>) -> Self {
        self.next_run_at = Some(when);
        self
    }

    pub fn repeat_every(mut self, interval: impl Into<String>, timezone: Option<String>) -> Self {
        self.repeat_interval = Some(interval.into());
        self.repeat_timezone = timezone;
        self
    }

    pub fn repeat_at(mut self, phrase: impl Into<String>) -> Self {
        self.repeat_at = Some(phrase.into());
        self
    }

    pub fn unique(mut self, key: serde_json::Map<String, Value>, opts: UniqueOpts) -> Self {
        self.unique = Some(key);
        self.unique_opts = Some(opts);
        self
    }

    pub fn start_date(mut self, d: DateTime<Utc>) -> Self {
        self.start_date = Some(d);
        self
    }

    pub fn end_date(mut self, d: DateTime<Utc>) -> Self {
        self.end_date = Some(d);
        self
    }

    pub fn skip_days(mut self, s: SkipDays) -> Self {
        self.skip_days = s;
        self
    }

    pub fn disable(mut self) -> Self {
        self.disabled = true;
        self
    }

    pub fn enable(mut self) -> Self {
        self.disabled = false;
        self
    }

    pub fn is_running(&self) -> bool {
        self.locked_at.is_some()
    }

    /// Records a handler failure: bumps `failCount`, stamps `failedAt` and
    /// `lastFinishedAt`, and schedules a retry via `backoff` if one is
    /// configured and yields a delay for this attempt. Otherwise
    /// `nextRunAt` is left unchanged — no automatic retry (spec.md §4.2).
    pub fn fail(
        &mut self,
        reason: impl Into<String>,
        now: DateTime<Utc>,
        backoff: Option<&(dyn Fn(BackoffInput) -> BackoffOutcome + Send + Sync)>,
    ) -> Option<i64> {
        let reason = reason.into();
        self.fail_reason = Some(reason.clone());
        self.fail_count += 1;
        self.failed_at = Some(now);
        self.last_finished_at = Some(now);

        if let Some(backoff) = backoff {
            let outcome = backoff(BackoffInput {
                attempt: self.fail_count,
                error: reason,
                job_name: self.name.clone(),
                data: self.data.clone(),
            });
            if let BackoffOutcome::Delay(ms) = outcome {
                self.next_run_at = Some(now + Duration::milliseconds(ms));
                return Some(ms);
            }
        }
        None
    }

    /// Refresh the lock to signal the processor's watchdog that this run is
    /// still alive.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.locked_at = Some(now);
    }
}

/// Computes the non-persisted derived state, spec.md §3.2 rule 7.
pub fn derive_state(job: &Job, now: DateTime<Utc>) -> JobState {
    if job.is_running() {
        return JobState::Running;
    }
    if let (Some(failed_at), last_finished_at) = (job.failed_at, job.last_finished_at) {
        let failed_after_finish = match last_finished_at {
            Some(finished) => failed_at > finished,
            None => true,
        };
        if failed_after_finish {
            return JobState::Failed;
        }
    }
    if job.repeat_interval.is_some() || job.repeat_at.is_some() {
        return JobState::Repeating;
    }
    match job.next_run_at {
        Some(next) if next > now => JobState::Scheduled,
        Some(_) => JobState::Queued,
        None => JobState::Completed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_job_defaults_to_normal_unlocked() {
        let job = Job::new("send-email", serde_json::json!({"to": "a@b.com"}));
        assert_eq!(job.job_type, JobType::Normal);
        assert!(!job.is_running());
        assert_eq!(job.priority, 0);
    }

    #[test]
    fn fail_without_backoff_leaves_next_run_at_unchanged() {
        let mut job = Job::new("x", Value::Null);
        job.next_run_at = Some(Utc::now());
        let before = job.next_run_at;
        let delay = job.fail("boom", Utc::now(), None);
        assert!(delay.is_none());
        assert_eq!(job.next_run_at, before);
        assert_eq!(job.fail_count, 1);
    }

    #[test]
    fn derive_state_prefers_running_over_everything() {
        let mut job = Job::new("x", Value::Null);
        job.locked_at = Some(Utc::now());
        job.failed_at = Some(Utc::now());
        assert_eq!(derive_state(&job, Utc::now()), JobState::Running);
    }

    #[test]
    fn derive_state_completed_when_no_next_run_and_not_repeating() {
        let job = Job::new("x", Value::Null);
        assert_eq!(derive_state(&job, Utc::now()), JobState::Completed);
    }

    #[test]
    fn derive_state_scheduled_vs_queued() {
        let mut job = Job::new("x", Value::Null);
        let now = Utc::now();
        job.next_run_at = Some(now + Duration::minutes(5));
        assert_eq!(derive_state(&job, now), JobState::Scheduled);
        job.next_run_at = Some(now - Duration::minutes(5));
        assert_eq!(derive_state(&job, now), JobState::Queued);
    }

    #[test]
    fn skip_days_maps_sunday_to_zero() {
        let days = SkipDays::new([Weekday::Sun, Weekday::Sat]);
        assert!(days.contains(Weekday::Sun));
        assert!(days.contains(Weekday::Sat));
        assert!(!days.contains(Weekday::Mon));
    }
}
