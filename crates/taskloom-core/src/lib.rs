//! # Taskloom
//!
//! A distributed, persistent job scheduling and dispatch engine. Jobs are
//! rows in a shared datastore; any number of processes can run the same
//! engine against that store and compete for work through atomic locking,
//! so there is no single point of coordination to keep alive.
//!
//! ## Core Concepts
//!
//! - [`Job`] — a persisted record describing what to run, when, and how
//!   often. Created fluently, then handed to the [`Scheduler`] to save.
//! - [`Repository`] — the only place distributed concurrency control
//!   lives. The crate ships no concrete implementation; pair this crate
//!   with a driver such as `taskloom-postgres` or `taskloom-testing`.
//! - [`Scheduler`] — the facade applications hold onto: defines handlers,
//!   creates/schedules jobs, and owns the running [`processor::Processor`].
//!
//! ## Architecture
//!
//! ```text
//! Scheduler::schedule()/every()/now()
//!         │
//!         ▼ SaveOrchestrator::save()
//!   Repository::save_job()  ──────────────► shared datastore
//!         │                                       ▲
//!         │ on-the-fly hint                        │ poll tick
//!         ▼                                       │
//!   Processor (single actor task) ◄───────────────┘
//!         │
//!         ├─► lock_job() / get_next_job_to_run()
//!         ├─► dispatch: priority queue, concurrency + lock-limit gates
//!         ├─► spawn handler task, arm lock-expiry watchdog
//!         └─► handler result ─► Job::fail()/backoff ─► save_job_state()
//! ```
//!
//! ## Guarantees
//!
//! - **At-most-once concurrent execution** per locked job: the lock is an
//!   atomic compare-and-set in the repository.
//! - **At-least-once eventual execution**: an abandoned lock (no `touch()`
//!   before `lockLifetime` elapses) is reclaimed and the job re-queued.
//! - **Single logical timeline** per running `Scheduler`: all dispatch
//!   bookkeeping is owned by one actor task, never a shared mutex.
//!
//! ## What This Is Not
//!
//! Taskloom is **not**:
//! - A message queue or pub/sub system (see [`notification`] for the thin,
//!   optional cross-process hint channel it does use)
//! - A workflow/saga engine with branching step graphs
//! - A metrics or dashboarding product — [`Scheduler::get_jobs_overview`]
//!   returns counts, nothing more

mod backoff;
#[cfg(test)]
mod e2e_tests;
mod error;
mod event;
mod job;
mod notification;
pub mod processor;
mod repository;
mod save;
mod scheduler;
mod time;

pub use backoff::{aggressive, combine, constant, exponential, linear, relaxed, standard, when, BackoffFn, BackoffInput, BackoffOutcome};
pub use error::{Categorizable, Result, SafeErrorCategory, TaskloomError};
pub use event::{Event, EventBus, EventHandler, JobEvent, RetryEvent};
pub use job::{
    derive_state, DebounceConfig, DebounceStrategy, Job, JobId, JobState, JobType, Priority,
    SkipDays, UniqueOpts,
};
pub use notification::{
    ChannelState, JobNotification, JobNotificationHandler, JobStateHandler, JobStateKind,
    JobStateNotification, NotificationChannel,
};
pub use processor::{Done, DrainResult, Handler, JobContext, ProcessorOptions};
pub use repository::{
    AuditInfo, JobsOverview, JobsOverviewRow, QueryFilter, QueryResult, RemoveFilter, Repository,
    Sort, SortDirection, SortField,
};
pub use save::{initial_debounce_save, resolve_save, SaveDecision};
pub use scheduler::{DefineOptions, EveryOptions, JobNames, ScheduleOptions, Schedulable, Scheduler, SchedulerBuilder};
pub use time::{parse_date_phrase, parse_human_interval, parse_time_of_day, parse_timezone};

pub mod backoff_policies {
    //! Re-exported at the crate root as well; kept as a named module so
    //! `use taskloom_core::backoff_policies::*` reads naturally for callers
    //! that want every preset without naming each one.
    pub use crate::backoff::{aggressive, relaxed, standard};
}
