//! User-visible events, spec.md §6.4.
//!
//! A small in-process pub/sub keyed by event kind (`"success"`) and,
//! additionally, by `"<kind>:<jobName>"` so callers can subscribe narrowly.
//! Kept deliberately simple — this is not the cross-process transport (that
//! is [`crate::notification::NotificationChannel`]); it is the local
//! `on("success:<name>", …)` surface the facade re-emits remote events onto
//! as well (spec.md §4.6).

use std::sync::Arc;

use dashmap::DashMap;

use crate::job::Job;

#[derive(Debug, Clone)]
pub struct JobEvent {
    pub job: Job,
    pub remote: bool,
}

#[derive(Debug, Clone)]
pub struct RetryEvent {
    pub job: Job,
    pub attempt: u32,
    pub delay_ms: i64,
    pub remote: bool,
}

#[derive(Debug, Clone)]
pub enum Event {
    Ready,
    Error(String),
    Start(JobEvent),
    Success(JobEvent),
    Fail(JobEvent),
    Complete(JobEvent),
    Expire(JobEvent),
    Retry(RetryEvent),
    RetryExhausted(JobEvent),
}

impl Event {
    /// The bare event kind used as a subscription key (`"success"`,
    /// `"retry exhausted"`, ...).
    pub fn kind(&self) -> &'static str {
        match self {
            Event::Ready => "ready",
            Event::Error(_) => "error",
            Event::Start(_) => "start",
            Event::Success(_) => "success",
            Event::Fail(_) => "fail",
            Event::Complete(_) => "complete",
            Event::Expire(_) => "expire",
            Event::Retry(_) => "retry",
            Event::RetryExhausted(_) => "retry exhausted",
        }
    }

    /// The job name this event concerns, if any — used to build the
    /// `"<kind>:<name>"` subscription key.
    pub fn job_name(&self) -> Option<&str> {
        match self {
            Event::Start(e)
            | Event::Success(e)
            | Event::Fail(e)
            | Event::Complete(e)
            | Event::Expire(e)
            | Event::RetryExhausted(e) => Some(e.job.name.as_str()),
            Event::Retry(e) => Some(e.job.name.as_str()),
            Event::Ready | Event::Error(_) => None,
        }
    }
}

pub type EventHandler = Arc<dyn Fn(&Event) + Send + Sync>;

/// Subscriber registry keyed by event kind, with lock-free concurrent
/// registration and lookup.
#[derive(Default)]
pub struct EventBus {
    handlers: DashMap<String, Vec<EventHandler>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(&self, key: impl Into<String>, handler: EventHandler) {
        self.handlers.entry(key.into()).or_default().push(handler);
    }

    pub fn emit(&self, event: Event) {
        if let Some(handlers) = self.handlers.get(event.kind()) {
            for h in handlers.iter() {
                h(&event);
            }
        }
        if let Some(name) = event.job_name() {
            let scoped_key = format!("{}:{}", event.kind(), name);
            if let Some(handlers) = self.handlers.get(&scoped_key) {
                for h in handlers.iter() {
                    h(&event);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::Job;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn emits_to_bare_and_scoped_subscribers() {
        let bus = EventBus::new();
        let bare_count = Arc::new(AtomicUsize::new(0));
        let scoped_count = Arc::new(AtomicUsize::new(0));

        let bare = bare_count.clone();
        bus.on("success", Arc::new(move |_| { bare.fetch_add(1, Ordering::SeqCst); }));
        let scoped = scoped_count.clone();
        bus.on("success:send-email", Arc::new(move |_| { scoped.fetch_add(1, Ordering::SeqCst); }));

        let job = Job::new("send-email", serde_json::Value::Null);
        bus.emit(Event::Success(JobEvent { job, remote: false }));

        assert_eq!(bare_count.load(Ordering::SeqCst), 1);
        assert_eq!(scoped_count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn other_job_names_do_not_receive_scoped_events() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        bus.on("success:other-job", Arc::new(move |_| { c.fetch_add(1, Ordering::SeqCst); }));

        let job = Job::new("send-email", serde_json::Value::Null);
        bus.emit(Event::Success(JobEvent { job, remote: false }));

        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
