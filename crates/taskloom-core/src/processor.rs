//! Job Processor, spec.md §4.5 — the heart of the engine.
//!
//! A single actor task owns every piece of mutable dispatch state (the
//! ready queue, per-definition counters, lock-expiry watchdogs); all other
//! code talks to it over an `mpsc` channel rather than sharing a
//! `Mutex`-wrapped struct across tasks, satisfying the "single logical
//! timeline" requirement of spec.md §5. Handler bodies run on their own
//! spawned task and report back over the same channel, so a slow or wedged
//! handler never blocks dispatch bookkeeping.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::backoff::{BackoffFn, BackoffOutcome};
use crate::error::{Categorizable, SafeErrorCategory, TaskloomError};
use crate::event::{Event, EventBus, JobEvent, RetryEvent};
use crate::job::{Job, JobId};
use crate::notification::{ChannelState, JobNotification, JobStateKind, JobStateNotification, NotificationChannel};
use crate::repository::{AuditInfo, Repository};
use crate::time;

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// A handle a running handler uses to extend its own lock lifetime and
/// report progress. Carries a clone of the job as it stood at dispatch
/// time.
#[derive(Clone)]
pub struct JobContext {
    pub job: Job,
    tx: mpsc::UnboundedSender<ProcessorMsg>,
}

impl JobContext {
    /// Refresh the lock so the watchdog does not treat this run as
    /// abandoned.
    pub fn touch(&self) {
        let _ = self.tx.send(ProcessorMsg::Touch(self.job.id.expect("dispatched job has an id")));
    }

    pub fn set_progress(&self, percent: u8) {
        let _ = self.tx.send(ProcessorMsg::Progress(
            self.job.id.expect("dispatched job has an id"),
            percent.min(100),
        ));
    }
}

/// Guards a callback-style handler against calling `done` more than once.
#[derive(Clone)]
pub struct Done(Arc<Mutex<Option<oneshot::Sender<Result<(), String>>>>>);

impl Done {
    pub fn call(&self, err: Option<anyhow::Error>) {
        if let Some(tx) = self.0.lock().unwrap().take() {
            let _ = tx.send(err.map_or(Ok(()), |e| Err(e.to_string())));
        }
    }
}

type AsyncHandlerFn = Arc<dyn Fn(JobContext) -> BoxFuture<Result<(), anyhow::Error>> + Send + Sync>;
type CallbackHandlerFn = Arc<dyn Fn(JobContext, Done) + Send + Sync>;

/// Two handler signatures, spec.md §4.5: a plain async function, or a
/// callback-style function that reports completion through an explicit
/// `done(err?)`.
#[derive(Clone)]
pub enum Handler {
    Async(AsyncHandlerFn),
    Callback(CallbackHandlerFn),
}

impl Handler {
    async fn invoke(&self, ctx: JobContext) -> Result<(), String> {
        match self {
            Handler::Async(f) => f(ctx).await.map_err(|e| e.to_string()),
            Handler::Callback(f) => {
                let (tx, rx) = oneshot::channel();
                let done = Done(Arc::new(Mutex::new(Some(tx))));
                f(ctx, done);
                rx.await.unwrap_or_else(|_| Err("handler dropped without calling done".into()))
            }
        }
    }
}

#[derive(Clone)]
pub struct JobDefinition {
    pub handler: Handler,
    pub concurrency: usize,
    pub lock_limit: usize,
    pub lock_lifetime: Duration,
    pub priority: i32,
    pub backoff: Option<BackoffFn>,
    pub remove_on_complete: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct ProcessorOptions {
    pub max_concurrency: usize,
    pub lock_limit: usize,
    pub process_every: StdDuration,
}

impl Default for ProcessorOptions {
    fn default() -> Self {
        Self { max_concurrency: 20, lock_limit: 0, process_every: StdDuration::from_secs(5) }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DrainResult {
    pub completed: usize,
    pub running: usize,
    pub timed_out: bool,
    pub aborted: bool,
}

pub(crate) enum ProcessorMsg {
    PollTick,
    OnTheFly(JobId),
    LockExpired(JobId, DateTime<Utc>),
    HandlerFinished(JobId, Result<(), String>),
    Touch(JobId),
    Progress(JobId, u8),
    Drain { reply: oneshot::Sender<DrainResult>, deadline: Option<StdDuration> },
    DrainTimeout,
    Stop { reply: oneshot::Sender<()> },
}

#[derive(Clone, Default)]
struct DefCounters {
    running: usize,
    locked: usize,
}

struct RunningEntry {
    def_name: String,
    locked_at: DateTime<Utc>,
    watchdog: JoinHandle<()>,
}

/// Owns the processor actor's channel sender; this is the handle the
/// facade and save orchestrator use to talk to the running actor.
#[derive(Clone)]
pub struct ProcessorHandle {
    tx: mpsc::UnboundedSender<ProcessorMsg>,
    pub(crate) next_scan_at_millis: Arc<AtomicI64>,
}

impl ProcessorHandle {
    pub fn notify_saved(&self, job_id: JobId) {
        let _ = self.tx.send(ProcessorMsg::OnTheFly(job_id));
    }

    pub async fn drain(&self, deadline: Option<StdDuration>) -> DrainResult {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(ProcessorMsg::Drain { reply, deadline });
        rx.await.unwrap_or_default()
    }

    pub async fn stop(&self) {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(ProcessorMsg::Stop { reply });
        let _ = rx.await;
    }

    pub(crate) fn on_the_fly_sender(&self) -> mpsc::UnboundedSender<ProcessorMsg> {
        self.tx.clone()
    }
}

pub struct Processor {
    definitions: Arc<HashMap<String, JobDefinition>>,
    repo: Arc<dyn Repository>,
    channel: Option<Arc<dyn NotificationChannel>>,
    events: Arc<EventBus>,
    options: ProcessorOptions,
    source: Uuid,

    queue: Vec<Job>,
    running: HashMap<JobId, RunningEntry>,
    per_def: HashMap<String, DefCounters>,
    next_scan_at_millis: Arc<AtomicI64>,
    stopping: bool,
    pending_drain: Option<(oneshot::Sender<DrainResult>, Option<JoinHandle<()>>)>,
    drain_completed: usize,

    tx: mpsc::UnboundedSender<ProcessorMsg>,
    rx: mpsc::UnboundedReceiver<ProcessorMsg>,
}

impl Processor {
    pub fn new(
        definitions: Arc<HashMap<String, JobDefinition>>,
        repo: Arc<dyn Repository>,
        channel: Option<Arc<dyn NotificationChannel>>,
        events: Arc<EventBus>,
        options: ProcessorOptions,
        source: Uuid,
    ) -> (Self, ProcessorHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let next_scan_at_millis = Arc::new(AtomicI64::new(i64::MAX));
        let handle = ProcessorHandle { tx: tx.clone(), next_scan_at_millis: next_scan_at_millis.clone() };
        let per_def = definitions.keys().map(|k| (k.clone(), DefCounters::default())).collect();
        let processor = Self {
            definitions,
            repo,
            channel,
            events,
            options,
            source,
            queue: Vec::new(),
            running: HashMap::new(),
            per_def,
            next_scan_at_millis,
            stopping: false,
            pending_drain: None,
            drain_completed: 0,
            tx,
            rx,
        };
        (processor, handle)
    }

    /// Spawns the actor loop plus its polling-tick driver. Returns the
    /// `JoinHandle` so the facade can await it on full shutdown.
    pub fn spawn(mut self) -> JoinHandle<()> {
        let tick_tx = self.tx.clone();
        let process_every = self.options.process_every;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(process_every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            tokio::spawn(async move {
                loop {
                    ticker.tick().await;
                    if tick_tx.send(ProcessorMsg::PollTick).is_err() {
                        break;
                    }
                }
            });
            self.run().await;
        })
    }

    async fn run(&mut self) {
        while let Some(msg) = self.rx.recv().await {
            match msg {
                ProcessorMsg::PollTick => self.poll_tick().await,
                ProcessorMsg::OnTheFly(id) => self.try_lock_on_the_fly(id).await,
                ProcessorMsg::LockExpired(id, observed) => self.handle_lock_expired(id, observed).await,
                ProcessorMsg::HandlerFinished(id, outcome) => self.handle_finished(id, outcome).await,
                ProcessorMsg::Touch(id) => self.handle_touch(id).await,
                ProcessorMsg::Progress(id, pct) => self.handle_progress(id, pct).await,
                ProcessorMsg::Drain { reply, deadline } => self.begin_drain(reply, deadline),
                ProcessorMsg::DrainTimeout => self.finish_drain(true, false),
                ProcessorMsg::Stop { reply } => {
                    self.do_stop().await;
                    let _ = reply.send(());
                    return;
                }
            }
            if self.pending_drain.is_some() && self.running.is_empty() {
                self.finish_drain(false, false);
            }
        }
    }

    async fn poll_tick(&mut self) {
        if self.stopping {
            return;
        }
        let now = Utc::now();
        let next_scan_at = now + Duration::from_std(self.options.process_every).unwrap_or(Duration::seconds(5));
        self.next_scan_at_millis.store(next_scan_at.timestamp_millis(), Ordering::Relaxed);

        let names: Vec<String> = self.definitions.keys().cloned().collect();
        for name in names {
            loop {
                if !self.has_capacity_to_lock(&name) {
                    break;
                }
                let lock_lifetime = self.definitions[&name].lock_lifetime;
                let lock_deadline = now - lock_lifetime;
                let result = self
                    .repo
                    .get_next_job_to_run(&name, next_scan_at, lock_deadline, now, AuditInfo::default())
                    .await;
                match result {
                    Ok(Some(job)) => self.enqueue(job),
                    Ok(None) => break,
                    Err(e) => {
                        self.report_repo_error(&format!("get_next_job_to_run({name})"), e);
                        break;
                    }
                }
            }
        }
        self.dispatch().await;
    }

    async fn try_lock_on_the_fly(&mut self, id: JobId) {
        if self.stopping {
            return;
        }
        let Ok(Some(job)) = self.repo.get_job_by_id(id).await else { return };
        if job.disabled || job.locked_at.is_some() {
            return;
        }
        if !self.has_capacity_to_lock(&job.name) {
            return;
        }
        let next_scan_at = self.next_scan_at_millis.load(Ordering::Relaxed);
        let due_now = job.next_run_at.is_some_and(|n| next_scan_at == i64::MAX || n.timestamp_millis() <= next_scan_at);
        if !due_now {
            return;
        }
        match self.repo.lock_job(&job, AuditInfo::default()).await {
            Ok(Some(locked)) => self.enqueue(locked),
            Ok(None) => {}
            Err(e) => self.report_repo_error("lock_job(on-the-fly)", e),
        }
        self.dispatch().await;
    }

    fn has_capacity_to_lock(&self, name: &str) -> bool {
        let global_locked = self.queue.len() + self.running.len();
        if self.options.lock_limit > 0 && global_locked >= self.options.lock_limit {
            return false;
        }
        if let Some(def) = self.definitions.get(name) {
            if def.lock_limit > 0 {
                let locked = self.per_def.get(name).map(|c| c.locked).unwrap_or(0);
                if locked >= def.lock_limit {
                    return false;
                }
            }
        }
        true
    }

    /// Priority-descending insert, spec.md §4.5 "Ready queue".
    fn enqueue(&mut self, job: Job) {
        if let Some(counters) = self.per_def.get_mut(&job.name) {
            counters.locked += 1;
        }
        let pos = self.queue.iter().position(|j| j.priority < job.priority).unwrap_or(self.queue.len());
        self.queue.insert(pos, job);
    }

    async fn dispatch(&mut self) {
        let now = Utc::now();
        let mut i = 0;
        while i < self.queue.len() {
            if self.running.len() >= self.options.max_concurrency {
                break;
            }
            let name = self.queue[i].name.clone();
            let def_running = self.per_def.get(&name).map(|c| c.running).unwrap_or(0);
            let concurrency = self.definitions.get(&name).map(|d| d.concurrency).unwrap_or(1);
            if def_running >= concurrency {
                i += 1;
                continue;
            }
            let due = self.queue[i].next_run_at.map_or(true, |n| n <= now);
            if !due {
                let delay = (self.queue[i].next_run_at.unwrap() - now).to_std().unwrap_or(StdDuration::ZERO);
                let tx = self.tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = tx.send(ProcessorMsg::PollTick);
                });
                i += 1;
                continue;
            }
            let job = self.queue.remove(i);
            self.start_execution(job).await;
        }
    }

    /// Classifies an error via [`Categorizable`] and reacts accordingly:
    /// transient errors (repository/notification I/O) are just logged, since
    /// the next poll tick will retry on its own; anything else is fatal to
    /// the affected job, so it's failed outright and its lock released
    /// rather than left to leak.
    fn report_repo_error(&self, context: &str, err: anyhow::Error) {
        let categorized = TaskloomError::Repository(err);
        match categorized.category() {
            SafeErrorCategory::Transient => warn!(%context, error = %categorized, "transient, will retry next tick"),
            SafeErrorCategory::Fatal => error!(%context, error = %categorized, "unrecoverable"),
        }
        self.events.emit(Event::Error(format!("{context}: {categorized}")));
    }

    async fn start_execution(&mut self, mut job: Job) {
        let name = job.name.clone();
        let Some(def) = self.definitions.get(&name).cloned() else {
            let err = TaskloomError::UndefinedJobName(name);
            match err.category() {
                SafeErrorCategory::Fatal => {
                    let now = Utc::now();
                    job.fail(err.to_string(), now, None);
                    job.locked_at = None;
                    let _ = self.repo.save_job_state(&job, AuditInfo::default()).await;
                    self.events.emit(Event::Fail(JobEvent { job, remote: false }));
                }
                SafeErrorCategory::Transient => self.events.emit(Event::Error(err.to_string())),
            }
            return;
        };
        let now = Utc::now();
        let id = job.id.expect("locked job has an id");

        job.last_run_at = Some(now);
        match time::compute_next_run_at(&job, now) {
            Ok(next) => {
                job.next_run_at = next;
                if next.is_none() {
                    job.repeat_interval = None;
                    job.repeat_at = None;
                }
            }
            Err(e) => {
                job.fail(e.to_string(), now, def.backoff.as_deref());
            }
        }

        if let Err(e) = self.repo.save_job_state(&job, AuditInfo::default()).await {
            self.events.emit(Event::Error(format!("save_job_state(start {name}): {e}")));
        }

        if let Some(counters) = self.per_def.get_mut(&name) {
            counters.running += 1;
        }

        self.events.emit(Event::Start(JobEvent { job: job.clone(), remote: false }));
        if let Some(ch) = &self.channel {
            let _ = ch
                .publish_state(JobStateNotification {
                    job_id: id,
                    job_name: name.clone(),
                    kind: JobStateKind::Start,
                    progress: None,
                    error: None,
                    fail_count: None,
                    retry_at: None,
                    retry_attempt: None,
                    duration_ms: None,
                    last_run_at: job.last_run_at,
                    last_finished_at: None,
                    timestamp: now,
                    source: self.source,
                })
                .await;
        }

        let locked_at = job.locked_at.unwrap_or(now);
        let watchdog_tx = self.tx.clone();
        let fire_in = (locked_at + def.lock_lifetime - Utc::now()).to_std().unwrap_or(StdDuration::ZERO);
        let watchdog = tokio::spawn(async move {
            tokio::time::sleep(fire_in).await;
            let _ = watchdog_tx.send(ProcessorMsg::LockExpired(id, locked_at));
        });
        self.running.insert(id, RunningEntry { def_name: name.clone(), locked_at, watchdog });

        let ctx = JobContext { job: job.clone(), tx: self.tx.clone() };
        let handler = def.handler.clone();
        let finished_tx = self.tx.clone();
        tokio::spawn(async move {
            let outcome = handler.invoke(ctx).await;
            let _ = finished_tx.send(ProcessorMsg::HandlerFinished(id, outcome));
        });
    }

    async fn handle_finished(&mut self, id: JobId, outcome: Result<(), String>) {
        let Some(entry) = self.running.remove(&id) else { return };
        entry.watchdog.abort();
        if let Some(counters) = self.per_def.get_mut(&entry.def_name) {
            counters.running = counters.running.saturating_sub(1);
            counters.locked = counters.locked.saturating_sub(1);
        }

        let Ok(Some(mut job)) = self.repo.get_job_by_id(id).await else { return };
        let now = Utc::now();
        let def = self.definitions.get(&entry.def_name).cloned();

        match outcome {
            Ok(()) => {
                job.last_finished_at = Some(now);
                job.locked_at = None;
                let _ = self.repo.save_job_state(&job, AuditInfo::default()).await;
                self.events.emit(Event::Success(JobEvent { job: job.clone(), remote: false }));
                self.publish_state(&job, JobStateKind::Success, None).await;

                let recurring = job.repeat_interval.is_some() || job.repeat_at.is_some();
                if def.as_ref().is_some_and(|d| d.remove_on_complete) && !recurring {
                    let _ = self
                        .repo
                        .remove_jobs(crate::repository::RemoveFilter { id: Some(id), ..Default::default() })
                        .await;
                }
            }
            Err(reason) => {
                let backoff = def.as_ref().and_then(|d| d.backoff.as_deref());
                let delay = job.fail(reason.clone(), now, backoff);
                job.locked_at = None;
                let _ = self.repo.save_job_state(&job, AuditInfo::default()).await;
                self.events.emit(Event::Fail(JobEvent { job: job.clone(), remote: false }));
                self.publish_state(&job, JobStateKind::Fail, Some(reason)).await;

                match (def.as_ref().and_then(|d| d.backoff.clone()), delay) {
                    (Some(_), Some(ms)) => {
                        self.events.emit(Event::Retry(RetryEvent {
                            job: job.clone(),
                            attempt: job.fail_count,
                            delay_ms: ms,
                            remote: false,
                        }));
                    }
                    (Some(_), None) => {
                        self.events.emit(Event::RetryExhausted(JobEvent { job: job.clone(), remote: false }));
                    }
                    (None, _) => {}
                }
            }
        }

        if self.pending_drain.is_some() {
            self.drain_completed += 1;
        }
        self.events.emit(Event::Complete(JobEvent { job, remote: false }));
        self.dispatch().await;
    }

    async fn publish_state(&self, job: &Job, kind: JobStateKind, error: Option<String>) {
        if let Some(ch) = &self.channel {
            let _ = ch
                .publish_state(JobStateNotification {
                    job_id: job.id.unwrap_or_default(),
                    job_name: job.name.clone(),
                    kind,
                    progress: job.progress,
                    error,
                    fail_count: Some(job.fail_count),
                    retry_at: job.next_run_at,
                    retry_attempt: Some(job.fail_count),
                    duration_ms: job.last_run_at.map(|s| (Utc::now() - s).num_milliseconds()),
                    last_run_at: job.last_run_at,
                    last_finished_at: job.last_finished_at,
                    timestamp: Utc::now(),
                    source: self.source,
                })
                .await;
        }
    }

    /// Lock-expiry watchdog fired. `observed` is the `lockedAt` we recorded
    /// when the timer was armed; if the job's current `lockedAt` still
    /// matches, the lock really is stale (no `touch`); otherwise `touch`
    /// moved the deadline and we rearm.
    async fn handle_lock_expired(&mut self, id: JobId, observed: DateTime<Utc>) {
        let Some(entry) = self.running.get(&id) else { return };
        if entry.locked_at != observed {
            // touch() moved the deadline; rearm against the new one.
            let def = self.definitions.get(&entry.def_name).cloned();
            let Some(def) = def else { return };
            let new_locked_at = entry.locked_at;
            let fire_in = (new_locked_at + def.lock_lifetime - Utc::now()).to_std().unwrap_or(StdDuration::ZERO);
            let tx = self.tx.clone();
            let watchdog = tokio::spawn(async move {
                tokio::time::sleep(fire_in).await;
                let _ = tx.send(ProcessorMsg::LockExpired(id, new_locked_at));
            });
            if let Some(entry) = self.running.get_mut(&id) {
                entry.watchdog = watchdog;
            }
            return;
        }

        warn!(job_id = %id, "lock expired, reclaiming; original invocation is abandoned, not killed");
        let entry = self.running.remove(&id).expect("checked above");
        if let Some(counters) = self.per_def.get_mut(&entry.def_name) {
            counters.running = counters.running.saturating_sub(1);
            counters.locked = counters.locked.saturating_sub(1);
        }

        if let Ok(Some(mut job)) = self.repo.get_job_by_id(id).await {
            let now = Utc::now();
            job.next_run_at = Some(job.next_run_at.map_or(now, |n| n.min(now)));
            let _ = self.repo.save_job_state(&job, AuditInfo::default()).await;
            self.events.emit(Event::Expire(JobEvent { job, remote: false }));
        }
        self.dispatch().await;
    }

    async fn handle_touch(&mut self, id: JobId) {
        let now = Utc::now();
        if let Some(entry) = self.running.get_mut(&id) {
            entry.locked_at = now;
        }
        if let Ok(Some(mut job)) = self.repo.get_job_by_id(id).await {
            job.locked_at = Some(now);
            let _ = self.repo.save_job_state(&job, AuditInfo::default()).await;
        }
    }

    async fn handle_progress(&mut self, id: JobId, percent: u8) {
        if let Ok(Some(mut job)) = self.repo.get_job_by_id(id).await {
            job.progress = Some(percent);
            let _ = self.repo.save_job_state(&job, AuditInfo::default()).await;
            self.publish_state(&job, JobStateKind::Progress, None).await;
        }
    }

    fn begin_drain(&mut self, reply: oneshot::Sender<DrainResult>, deadline: Option<StdDuration>) {
        self.stopping = true;
        self.drain_completed = 0;
        if self.running.is_empty() {
            let _ = reply.send(DrainResult { completed: 0, running: 0, timed_out: false, aborted: false });
            return;
        }
        let timeout_handle = deadline.map(|d| {
            let tx = self.tx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(d).await;
                let _ = tx.send(ProcessorMsg::DrainTimeout);
            })
        });
        self.pending_drain = Some((reply, timeout_handle));
    }

    fn finish_drain(&mut self, timed_out: bool, aborted: bool) {
        if let Some((reply, timeout_handle)) = self.pending_drain.take() {
            if let Some(h) = timeout_handle {
                h.abort();
            }
            let _ = reply.send(DrainResult {
                completed: self.drain_completed,
                running: self.running.len(),
                timed_out,
                aborted,
            });
            self.drain_completed = 0;
        }
    }

    async fn do_stop(&mut self) {
        self.stopping = true;
        let ids: Vec<JobId> = self.running.keys().copied().chain(self.queue.iter().filter_map(|j| j.id)).collect();
        for entry in self.running.values() {
            entry.watchdog.abort();
        }
        if !ids.is_empty() {
            if let Err(e) = self.repo.unlock_jobs(&ids).await {
                error!(error = %e, "failed to unlock jobs on stop");
            }
        }
        if let Some(ch) = &self.channel {
            let _ = ch.disconnect().await;
        }
        info!(channel_state = ?self.channel.as_ref().map(|c| c.state()).unwrap_or(ChannelState::Disconnected), "processor stopped");
    }
}

#[allow(dead_code)]
fn _assert_send<T: Send>() {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn def_counters_default_to_zero() {
        let c = DefCounters::default();
        assert_eq!(c.running, 0);
        assert_eq!(c.locked, 0);
    }
}
