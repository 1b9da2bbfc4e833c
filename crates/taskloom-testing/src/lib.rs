//! In-process test doubles for [`taskloom_core::Repository`] and
//! [`taskloom_core::NotificationChannel`] — no network, no external
//! process, so unit and end-to-end tests can exercise a full `Scheduler`
//! without a database.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

use taskloom_core::{
    derive_state, initial_debounce_save, resolve_save, AuditInfo, ChannelState, Job, JobId,
    JobNotification, JobNotificationHandler, JobState, JobStateHandler, JobStateNotification,
    JobType, JobsOverview, JobsOverviewRow, NotificationChannel, QueryFilter, QueryResult,
    RemoveFilter, Repository, SaveDecision, Sort, SortDirection, SortField,
};

/// `Mutex<HashMap<...>>`-backed repository. Good enough for tests: every
/// operation is already atomic with respect to the single process holding
/// the lock, which is the only concurrency this double needs to model.
#[derive(Default)]
pub struct MemoryRepository {
    jobs: Mutex<HashMap<JobId, Job>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn find_existing(jobs: &HashMap<JobId, Job>, job: &Job) -> Option<Job> {
        if let Some(id) = job.id {
            return jobs.get(&id).cloned();
        }
        if job.job_type == JobType::Single {
            return jobs.values().find(|j| j.name == job.name && j.job_type == JobType::Single).cloned();
        }
        if let Some(key) = &job.unique {
            return jobs.values().find(|j| j.unique.as_ref() == Some(key)).cloned();
        }
        None
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn connect(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn save_job(&self, job: Job, _audit: AuditInfo<'_>) -> anyhow::Result<Job> {
        let mut jobs = self.jobs.lock().unwrap();
        let existing = Self::find_existing(&jobs, &job);
        let now = Utc::now();

        let has_debounce = job.unique_opts.as_ref().and_then(|o| o.debounce.as_ref()).is_some();
        let decision = if existing.is_none() && has_debounce {
            SaveDecision::Write(initial_debounce_save(job, now))
        } else {
            resolve_save(existing, job, now)
        };

        let result = match decision {
            SaveDecision::NoOp(job) => job,
            SaveDecision::Write(mut job) => {
                let id = job.id.unwrap_or_else(uuid::Uuid::new_v4);
                job.id = Some(id);
                jobs.insert(id, job.clone());
                job
            }
        };
        Ok(result)
    }

    async fn save_job_state(&self, job: &Job, _audit: AuditInfo<'_>) -> anyhow::Result<()> {
        let id = job.id.ok_or_else(|| anyhow::anyhow!("job has no id"))?;
        let mut jobs = self.jobs.lock().unwrap();
        if let Some(existing) = jobs.get_mut(&id) {
            existing.next_run_at = job.next_run_at;
            existing.locked_at = job.locked_at;
            existing.last_run_at = job.last_run_at;
            existing.last_finished_at = job.last_finished_at;
            existing.failed_at = job.failed_at;
            existing.fail_count = job.fail_count;
            existing.fail_reason = job.fail_reason.clone();
            existing.progress = job.progress;
            existing.repeat_interval = job.repeat_interval.clone();
            existing.repeat_at = job.repeat_at.clone();
        }
        Ok(())
    }

    async fn lock_job(&self, job: &Job, _audit: AuditInfo<'_>) -> anyhow::Result<Option<Job>> {
        let id = job.id.ok_or_else(|| anyhow::anyhow!("job has no id"))?;
        let mut jobs = self.jobs.lock().unwrap();
        let Some(existing) = jobs.get_mut(&id) else { return Ok(None) };
        if existing.locked_at.is_some() || existing.disabled || existing.next_run_at != job.next_run_at {
            return Ok(None);
        }
        existing.locked_at = Some(Utc::now());
        Ok(Some(existing.clone()))
    }

    async fn unlock_job(&self, id: JobId) -> anyhow::Result<()> {
        if let Some(job) = self.jobs.lock().unwrap().get_mut(&id) {
            job.locked_at = None;
        }
        Ok(())
    }

    async fn unlock_jobs(&self, ids: &[JobId]) -> anyhow::Result<()> {
        let mut jobs = self.jobs.lock().unwrap();
        for id in ids {
            if let Some(job) = jobs.get_mut(id) {
                job.locked_at = None;
            }
        }
        Ok(())
    }

    async fn get_next_job_to_run(
        &self,
        name: &str,
        next_scan_at: DateTime<Utc>,
        lock_deadline: DateTime<Utc>,
        now: DateTime<Utc>,
        _audit: AuditInfo<'_>,
    ) -> anyhow::Result<Option<Job>> {
        let mut jobs = self.jobs.lock().unwrap();
        let candidate = jobs
            .values_mut()
            .filter(|j| {
                j.name == name
                    && !j.disabled
                    && ((j.locked_at.is_none() && j.next_run_at.is_some_and(|n| n <= next_scan_at))
                        || j.locked_at.is_some_and(|l| l < lock_deadline))
            })
            .min_by(|a, b| {
                b.priority.cmp(&a.priority).then(a.next_run_at.cmp(&b.next_run_at))
            });

        match candidate {
            Some(job) => {
                job.locked_at = Some(now);
                Ok(Some(job.clone()))
            }
            None => Ok(None),
        }
    }

    async fn get_job_by_id(&self, id: JobId) -> anyhow::Result<Option<Job>> {
        Ok(self.jobs.lock().unwrap().get(&id).cloned())
    }

    async fn query_jobs(&self, opts: QueryFilter) -> anyhow::Result<QueryResult> {
        let jobs = self.jobs.lock().unwrap();
        let mut matched: Vec<Job> = jobs
            .values()
            .filter(|j| opts.name.as_deref().map_or(true, |n| j.name == n))
            .filter(|j| opts.names.is_empty() || opts.names.contains(&j.name))
            .filter(|j| opts.id.map_or(true, |id| j.id == Some(id)))
            .filter(|j| opts.ids.is_empty() || j.id.is_some_and(|id| opts.ids.contains(&id)))
            .filter(|j| opts.search.as_deref().map_or(true, |s| j.name.contains(s)))
            .filter(|j| opts.include_disabled == Some(true) || !j.disabled)
            .cloned()
            .collect();

        let sort = opts.sort.unwrap_or_default();
        matched.sort_by(|a, b| {
            let ord = match sort.field {
                SortField::NextRunAt => a.next_run_at.cmp(&b.next_run_at),
                SortField::Priority => a.priority.cmp(&b.priority),
                SortField::LastRunAt => a.last_run_at.cmp(&b.last_run_at),
                SortField::Name => a.name.cmp(&b.name),
            };
            if sort.direction == SortDirection::Desc { ord.reverse() } else { ord }
        });

        let total = matched.len() as u64;
        let skip = opts.skip.unwrap_or(0) as usize;
        let matched = matched.into_iter().skip(skip);
        let jobs = match opts.limit {
            Some(limit) => matched.take(limit as usize).collect(),
            None => matched.collect(),
        };
        Ok(QueryResult { jobs, total })
    }

    async fn remove_jobs(&self, opts: RemoveFilter) -> anyhow::Result<u64> {
        let mut jobs = self.jobs.lock().unwrap();
        let before = jobs.len();
        jobs.retain(|id, job| {
            if let Some(target) = opts.id {
                if *id == target {
                    return false;
                }
            }
            if opts.ids.contains(id) {
                return false;
            }
            if let Some(name) = &opts.name {
                if &job.name == name {
                    return false;
                }
            }
            if opts.names.contains(&job.name) {
                return false;
            }
            if !opts.not_names.is_empty() && !opts.not_names.contains(&job.name) {
                return false;
            }
            true
        });
        Ok((before - jobs.len()) as u64)
    }

    async fn get_distinct_job_names(&self) -> anyhow::Result<Vec<String>> {
        let jobs = self.jobs.lock().unwrap();
        let mut names: Vec<String> = jobs.values().map(|j| j.name.clone()).collect();
        names.sort();
        names.dedup();
        Ok(names)
    }

    async fn get_jobs_overview(&self) -> anyhow::Result<Vec<JobsOverview>> {
        let jobs = self.jobs.lock().unwrap();
        let now = Utc::now();
        let mut by_name: HashMap<String, JobsOverviewRow> = HashMap::new();
        for job in jobs.values() {
            let row = by_name.entry(job.name.clone()).or_default();
            row.total += 1;
            match derive_state(job, now) {
                JobState::Running => row.running += 1,
                JobState::Scheduled => row.scheduled += 1,
                JobState::Queued => row.queued += 1,
                JobState::Completed => row.completed += 1,
                JobState::Failed => row.failed += 1,
                JobState::Repeating => row.repeating += 1,
            }
        }
        let mut out: Vec<JobsOverview> = by_name.into_iter().map(|(name, counts)| JobsOverview { name, counts }).collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    async fn get_queue_size(&self, now: DateTime<Utc>) -> anyhow::Result<u64> {
        let jobs = self.jobs.lock().unwrap();
        Ok(jobs.values().filter(|j| j.next_run_at.is_some_and(|n| n <= now) && j.locked_at.is_none()).count() as u64)
    }
}

/// In-process pub/sub over `tokio::sync::broadcast`, standing in for the
/// cross-process transport in tests. Lossy under backpressure just like the
/// real thing — a lagged receiver simply misses old notifications.
pub struct MemoryNotificationChannel {
    state: Mutex<ChannelState>,
    job_tx: broadcast::Sender<JobNotification>,
    state_tx: broadcast::Sender<JobStateNotification>,
}

impl Default for MemoryNotificationChannel {
    fn default() -> Self {
        let (job_tx, _) = broadcast::channel(256);
        let (state_tx, _) = broadcast::channel(256);
        Self { state: Mutex::new(ChannelState::Disconnected), job_tx, state_tx }
    }
}

impl MemoryNotificationChannel {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl NotificationChannel for MemoryNotificationChannel {
    async fn connect(&self) -> anyhow::Result<()> {
        *self.state.lock().unwrap() = ChannelState::Connected;
        Ok(())
    }

    async fn disconnect(&self) -> anyhow::Result<()> {
        *self.state.lock().unwrap() = ChannelState::Disconnected;
        Ok(())
    }

    fn state(&self) -> ChannelState {
        *self.state.lock().unwrap()
    }

    async fn subscribe(&self, handler: JobNotificationHandler) -> anyhow::Result<()> {
        let mut rx = self.job_tx.subscribe();
        tokio::spawn(async move {
            while let Ok(n) = rx.recv().await {
                handler(n);
            }
        });
        Ok(())
    }

    async fn publish(&self, notification: JobNotification) -> anyhow::Result<()> {
        let _ = self.job_tx.send(notification);
        Ok(())
    }

    async fn subscribe_state(&self, handler: JobStateHandler) -> anyhow::Result<()> {
        let mut rx = self.state_tx.subscribe();
        tokio::spawn(async move {
            while let Ok(n) = rx.recv().await {
                handler(n);
            }
        });
        Ok(())
    }

    async fn publish_state(&self, notification: JobStateNotification) -> anyhow::Result<()> {
        let _ = self.state_tx.send(notification);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn job(name: &str) -> Job {
        Job::new(name, json!({}))
    }

    #[tokio::test]
    async fn save_then_get_round_trips() {
        let repo = MemoryRepository::new();
        let saved = repo.save_job(job("send-email"), AuditInfo::default()).await.unwrap();
        let fetched = repo.get_job_by_id(saved.id.unwrap()).await.unwrap().unwrap();
        assert_eq!(fetched.name, "send-email");
    }

    #[tokio::test]
    async fn lock_job_is_exclusive() {
        let repo = MemoryRepository::new();
        let now = Utc::now();
        let mut j = job("x");
        j.next_run_at = Some(now);
        let saved = repo.save_job(j, AuditInfo::default()).await.unwrap();

        let locked = repo.lock_job(&saved, AuditInfo::default()).await.unwrap();
        assert!(locked.is_some());
        let second = repo.lock_job(&saved, AuditInfo::default()).await.unwrap();
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn get_next_job_to_run_skips_locked_and_future() {
        let repo = MemoryRepository::new();
        let now = Utc::now();

        let mut due = job("reminder");
        due.next_run_at = Some(now - chrono::Duration::seconds(1));
        repo.save_job(due, AuditInfo::default()).await.unwrap();

        let mut future = job("reminder");
        future.unique = Some(serde_json::Map::from_iter([("k".to_string(), json!(1))]));
        future.next_run_at = Some(now + chrono::Duration::hours(1));
        repo.save_job(future, AuditInfo::default()).await.unwrap();

        let picked = repo
            .get_next_job_to_run("reminder", now, now - chrono::Duration::minutes(10), now, AuditInfo::default())
            .await
            .unwrap();
        assert!(picked.is_some());
        assert!(picked.unwrap().locked_at.is_some());
    }

    #[tokio::test]
    async fn remove_jobs_by_name() {
        let repo = MemoryRepository::new();
        repo.save_job(job("a"), AuditInfo::default()).await.unwrap();
        repo.save_job(job("b"), AuditInfo::default()).await.unwrap();
        let removed = repo.remove_jobs(RemoveFilter { name: Some("a".into()), ..Default::default() }).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(repo.get_distinct_job_names().await.unwrap(), vec!["b".to_string()]);
    }

    #[tokio::test]
    async fn notification_channel_delivers_to_subscriber() {
        let channel = MemoryNotificationChannel::new();
        channel.connect().await.unwrap();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        channel
            .subscribe(Box::new(move |n| {
                let _ = tx.send(n);
            }))
            .await
            .unwrap();

        channel
            .publish(JobNotification {
                job_id: uuid::Uuid::new_v4(),
                job_name: "x".into(),
                next_run_at: None,
                priority: 0,
                timestamp: Utc::now(),
                source: uuid::Uuid::new_v4(),
            })
            .await
            .unwrap();

        let received = rx.recv().await.unwrap();
        assert_eq!(received.job_name, "x");
    }
}
