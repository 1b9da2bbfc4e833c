//! Scheduler Facade, spec.md §4.6.
//!
//! Lifecycle (`start`/`stop`/`drain`), the handler-definitions registry,
//! and the factory methods (`now`, `schedule`, `every`, `now_debounced`)
//! callers actually use. Thin by design: almost everything it does is
//! delegate to [`crate::save::SaveOrchestrator`] or
//! [`crate::processor::ProcessorHandle`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::backoff::BackoffFn;
use crate::error::{Result, TaskloomError};
use crate::event::{Event, EventBus, EventHandler, JobEvent, RetryEvent};
use crate::job::{Job, JobType, SkipDays};
use crate::notification::{JobNotification, JobStateKind, JobStateNotification, NotificationChannel};
use crate::processor::{DrainResult, Handler, JobDefinition, Processor, ProcessorHandle, ProcessorOptions};
use crate::repository::{JobsOverview, QueryFilter, QueryResult, RemoveFilter, Repository};
use crate::save::SaveOrchestrator;
use crate::time;

/// Per-definition overrides, spec.md §4.5 "Inputs".
#[derive(Clone)]
pub struct DefineOptions {
    pub concurrency: usize,
    pub lock_limit: usize,
    pub lock_lifetime: Duration,
    pub priority: i32,
    pub backoff: Option<BackoffFn>,
    pub remove_on_complete: bool,
}

impl Default for DefineOptions {
    fn default() -> Self {
        Self {
            concurrency: 1,
            lock_limit: 0,
            lock_lifetime: Duration::minutes(10),
            priority: 0,
            backoff: None,
            remove_on_complete: false,
        }
    }
}

#[derive(Clone, Default)]
pub struct EveryOptions {
    pub timezone: Option<String>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub skip_days: SkipDays,
    pub priority: i32,
    pub skip_immediate: bool,
}

#[derive(Clone, Default)]
pub struct ScheduleOptions {
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub skip_days: SkipDays,
    pub priority: i32,
}

/// One or several job names, accepted by [`Scheduler::every`].
pub enum JobNames {
    One(String),
    Many(Vec<String>),
}

impl From<&str> for JobNames {
    fn from(s: &str) -> Self {
        JobNames::One(s.to_string())
    }
}
impl From<String> for JobNames {
    fn from(s: String) -> Self {
        JobNames::One(s)
    }
}
impl From<Vec<String>> for JobNames {
    fn from(v: Vec<String>) -> Self {
        JobNames::Many(v)
    }
}

impl JobNames {
    fn into_vec(self) -> Vec<String> {
        match self {
            JobNames::One(s) => vec![s],
            JobNames::Many(v) => v,
        }
    }
}

pub struct SchedulerBuilder {
    repo: Arc<dyn Repository>,
    channel: Option<Arc<dyn NotificationChannel>>,
    options: ProcessorOptions,
    definitions: HashMap<String, JobDefinition>,
}

impl SchedulerBuilder {
    pub fn new(repo: Arc<dyn Repository>) -> Self {
        Self { repo, channel: None, options: ProcessorOptions::default(), definitions: HashMap::new() }
    }

    pub fn with_channel(mut self, channel: Arc<dyn NotificationChannel>) -> Self {
        self.channel = Some(channel);
        self
    }

    pub fn with_options(mut self, options: ProcessorOptions) -> Self {
        self.options = options;
        self
    }

    pub fn define(mut self, name: impl Into<String>, handler: Handler, opts: DefineOptions) -> Self {
        self.definitions.insert(
            name.into(),
            JobDefinition {
                handler,
                concurrency: opts.concurrency,
                lock_limit: opts.lock_limit,
                lock_lifetime: opts.lock_lifetime,
                priority: opts.priority,
                backoff: opts.backoff,
                remove_on_complete: opts.remove_on_complete,
            },
        );
        self
    }

    /// Connects the repository and (if present) the notification channel,
    /// subscribes to incoming notifications, and spawns the processor's
    /// polling loop.
    pub async fn start(self) -> Result<Scheduler> {
        let source = Uuid::new_v4();
        let events = Arc::new(EventBus::new());
        let definitions = Arc::new(self.definitions);

        self.repo.connect().await.map_err(TaskloomError::Repository)?;
        if let Some(ch) = &self.channel {
            ch.connect().await.map_err(TaskloomError::Notification)?;
        }

        let (processor, handle) =
            Processor::new(definitions.clone(), self.repo.clone(), self.channel.clone(), events.clone(), self.options, source);
        let join = processor.spawn();

        let save = SaveOrchestrator::new(self.repo.clone(), source.to_string(), handle.clone());

        let scheduler = Scheduler {
            repo: self.repo,
            channel: self.channel,
            definitions,
            events,
            processor: handle,
            processor_join: Some(join),
            save,
            source,
        };
        scheduler.subscribe_channel().await;
        scheduler.events.emit(Event::Ready);
        Ok(scheduler)
    }
}

pub struct Scheduler {
    repo: Arc<dyn Repository>,
    channel: Option<Arc<dyn NotificationChannel>>,
    definitions: Arc<HashMap<String, JobDefinition>>,
    events: Arc<EventBus>,
    processor: ProcessorHandle,
    processor_join: Option<JoinHandle<()>>,
    save: SaveOrchestrator,
    source: Uuid,
}

impl Scheduler {
    pub fn builder(repo: Arc<dyn Repository>) -> SchedulerBuilder {
        SchedulerBuilder::new(repo)
    }

    async fn subscribe_channel(&self) {
        let Some(ch) = &self.channel else { return };

        let processor = self.processor.clone();
        let _ = ch
            .subscribe(Box::new(move |n: JobNotification| {
                processor.notify_saved(n.job_id);
            }))
            .await;

        let events = self.events.clone();
        let source = self.source;
        let _ = ch
            .subscribe_state(Box::new(move |n: JobStateNotification| {
                if n.source == source {
                    return; // same-source notifications are dropped, spec.md §4.6.
                }
                let mut job = Job::new(n.job_name.clone(), Value::Null);
                job.id = Some(n.job_id);
                job.fail_count = n.fail_count.unwrap_or(0);
                job.progress = n.progress;
                job.last_run_at = n.last_run_at;
                job.last_finished_at = n.last_finished_at;
                job.next_run_at = n.retry_at;
                let event = match n.kind {
                    JobStateKind::Start => Event::Start(JobEvent { job, remote: true }),
                    JobStateKind::Progress => Event::Start(JobEvent { job, remote: true }),
                    JobStateKind::Success => Event::Success(JobEvent { job, remote: true }),
                    JobStateKind::Fail => Event::Fail(JobEvent { job, remote: true }),
                    JobStateKind::Complete => Event::Complete(JobEvent { job, remote: true }),
                    JobStateKind::Retry => Event::Retry(RetryEvent {
                        job,
                        attempt: n.retry_attempt.unwrap_or(0),
                        delay_ms: n.duration_ms.unwrap_or(0),
                        remote: true,
                    }),
                };
                events.emit(event);
            }))
            .await;
    }

    pub fn on(&self, key: impl Into<String>, handler: EventHandler) {
        self.events.on(key, handler);
    }

    /// Unsaved job, ready for further fluent configuration.
    pub fn create(&self, name: impl Into<String>, data: Value) -> Job {
        Job::new(name, data)
    }

    pub async fn now(&self, name: impl Into<String>, data: Value) -> Result<Job> {
        let job = Job::new(name, data).schedule_at(Utc::now());
        self.save.save(job).await.map_err(TaskloomError::Repository)
    }

    pub async fn schedule(
        &self,
        when: impl Into<Schedulable>,
        name: impl Into<String>,
        data: Value,
        opts: ScheduleOptions,
    ) -> Result<Job> {
        let now = Utc::now();
        let at = match when.into() {
            Schedulable::At(dt) => dt,
            Schedulable::Phrase(phrase) => time::parse_date_phrase(&phrase, now)?,
        };
        let mut job = Job::new(name, data).schedule_at(at);
        job.start_date = opts.start_date;
        job.end_date = opts.end_date;
        job.skip_days = opts.skip_days;
        job.priority = opts.priority;
        self.save.save(job).await.map_err(TaskloomError::Repository)
    }

    /// Creates (or re-anchors) a singleton recurring job per name.
    pub async fn every(
        &self,
        interval: impl Into<String>,
        names: impl Into<JobNames>,
        data: Value,
        opts: EveryOptions,
    ) -> Result<Vec<Job>> {
        let interval = interval.into();
        let mut out = Vec::new();
        for name in names.into().into_vec() {
            let mut job = Job::new(name, data.clone());
            job.job_type = JobType::Single;
            job.repeat_interval = Some(interval.clone());
            job.repeat_timezone = opts.timezone.clone();
            job.start_date = opts.start_date;
            job.end_date = opts.end_date;
            job.skip_days = opts.skip_days.clone();
            job.priority = opts.priority;

            let now = Utc::now();
            let mut first = time::compute_next_run_at(&job, now)?;
            if opts.skip_immediate {
                if let Some(prospective) = first {
                    job.last_run_at = Some(prospective);
                    first = time::compute_next_run_at(&job, now)?;
                    job.last_run_at = None;
                }
            }
            job.next_run_at = first;
            out.push(self.save.save(job).await.map_err(TaskloomError::Repository)?);
        }
        Ok(out)
    }

    /// Creates (or merges into) a unique, debounced job. Whether this is
    /// the first save or a merge into an existing window is decided inside
    /// the repository driver via the shared [`crate::save`] planning
    /// functions, since only the driver can atomically look up the
    /// existing record by its unique key.
    pub async fn now_debounced(
        &self,
        name: impl Into<String>,
        data: Value,
        unique_key: serde_json::Map<String, Value>,
        delay_ms: i64,
        opts: crate::job::DebounceConfig,
    ) -> Result<Job> {
        let mut debounce = opts;
        debounce.delay_ms = delay_ms;
        let job = Job::new(name, data).unique(
            unique_key,
            crate::job::UniqueOpts { insert_only: false, debounce: Some(debounce) },
        );
        self.save.save(job).await.map_err(TaskloomError::Repository)
    }

    pub async fn query_jobs(&self, mut opts: QueryFilter) -> Result<QueryResult> {
        let wanted_state = opts.state.take();
        let result = self.repo.query_jobs(opts).await.map_err(TaskloomError::Repository)?;
        let Some(wanted) = wanted_state else { return Ok(result) };

        let now = Utc::now();
        let jobs: Vec<Job> = result
            .jobs
            .into_iter()
            .filter(|j| crate::job::derive_state(j, now) == wanted)
            .collect();
        let total = jobs.len() as u64;
        Ok(QueryResult { jobs, total })
    }

    pub async fn get_jobs_overview(&self) -> Result<Vec<JobsOverview>> {
        self.repo.get_jobs_overview().await.map_err(TaskloomError::Repository)
    }

    pub async fn cancel(&self, opts: RemoveFilter) -> Result<u64> {
        self.repo.remove_jobs(opts).await.map_err(TaskloomError::Repository)
    }

    /// Removes every persisted job whose name is not among the defined
    /// handlers — standard maintenance for this family of schedulers.
    pub async fn purge(&self) -> Result<u64> {
        let not_names: Vec<String> = self.definitions.keys().cloned().collect();
        self.repo
            .remove_jobs(RemoveFilter { not_names, ..Default::default() })
            .await
            .map_err(TaskloomError::Repository)
    }

    pub async fn drain(&self, timeout: Option<StdDuration>) -> Result<DrainResult> {
        Ok(self.processor.drain(timeout).await)
    }

    pub async fn stop(mut self, close_connection: bool) -> Result<()> {
        self.processor.stop().await;
        if let Some(join) = self.processor_join.take() {
            let _ = join.await;
        }
        if close_connection {
            if let Some(ch) = &self.channel {
                let _ = ch.disconnect().await;
            }
        }
        Ok(())
    }
}

pub enum Schedulable {
    At(DateTime<Utc>),
    Phrase(String),
}

impl From<DateTime<Utc>> for Schedulable {
    fn from(dt: DateTime<Utc>) -> Self {
        Schedulable::At(dt)
    }
}
impl From<&str> for Schedulable {
    fn from(s: &str) -> Self {
        Schedulable::Phrase(s.to_string())
    }
}
impl From<String> for Schedulable {
    fn from(s: String) -> Self {
        Schedulable::Phrase(s)
    }
}
