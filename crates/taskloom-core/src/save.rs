//! Save Orchestrator, spec.md §4.4.
//!
//! [`resolve_save`] is the pure decision function shared by every
//! `Repository` driver: given whatever existing record the driver looked up
//! under the right key (by id, by the `{name,type:single}` singleton key, or
//! by the `unique` tuple) it returns the record to persist. Drivers stay
//! responsible for the atomic fetch-and-write itself (a transaction, or a
//! single upsert statement); the merge *semantics* live here once so
//! `taskloom-postgres` and `taskloom-testing` can never drift apart.
//!
//! [`SaveOrchestrator`] is the thin layer callers actually use: it stamps
//! audit metadata, calls `Repository::save_job`, and — if the resulting
//! `nextRunAt` is due before the processor's next poll — pushes the job
//! onto the on-the-fly lock path instead of waiting for that poll.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::job::{DebounceStrategy, Job, JobType};
use crate::processor::ProcessorHandle;
use crate::repository::{AuditInfo, Repository};

/// What to do with `incoming`, given whatever `existing` record the driver
/// fetched under the appropriate key.
pub enum SaveDecision {
    /// Persist this record: insert if `existing` was `None`, else update in
    /// place keeping `existing`'s id.
    Write(Job),
    /// `uniqueOpts.insertOnly` and a record already exists: make no change,
    /// return the existing record as-is.
    NoOp(Job),
}

pub fn resolve_save(existing: Option<Job>, mut incoming: Job, now: DateTime<Utc>) -> SaveDecision {
    let Some(mut existing) = existing else {
        return SaveDecision::Write(incoming);
    };
    incoming.id = existing.id;

    // type=single upsert: re-registering a recurrence (e.g. `every()` called
    // again on every process start) must not reset the schedule already in
    // flight, so the existing nextRunAt always wins over the incoming one.
    if incoming.job_type == JobType::Single {
        if let Some(existing_next) = existing.next_run_at {
            incoming.next_run_at = Some(existing_next);
        }
        return SaveDecision::Write(incoming);
    }

    if let Some(unique_opts) = incoming.unique_opts.clone() {
        if let Some(debounce) = unique_opts.debounce {
            let delay = chrono::Duration::milliseconds(debounce.delay_ms);
            incoming.debounce_started_at = existing.debounce_started_at.or(Some(now));

            match debounce.strategy {
                DebounceStrategy::Leading => {
                    // Leave the existing record as-is.
                    existing.last_modified_by = incoming.last_modified_by;
                    return SaveDecision::Write(existing);
                }
                DebounceStrategy::Trailing => {
                    let started = incoming.debounce_started_at.unwrap();
                    let forced = debounce
                        .max_wait_ms
                        .is_some_and(|max_wait| (now - started).num_milliseconds() >= max_wait);
                    if !forced {
                        incoming.next_run_at = Some(now + delay);
                    }
                    // else: leave existing.next_run_at (already carried by
                    // not touching it) unchanged, forcing execution.
                    if forced {
                        incoming.next_run_at = existing.next_run_at;
                    }
                    return SaveDecision::Write(incoming);
                }
            }
        }

        if unique_opts.insert_only {
            return SaveDecision::NoOp(existing);
        }
    }

    SaveDecision::Write(incoming)
}

/// First-ever save of a unique+debounced job: insert with
/// `nextRunAt = now + delay`, `debounceStartedAt = now` (spec.md §4.4).
pub fn initial_debounce_save(mut incoming: Job, now: DateTime<Utc>) -> Job {
    if let Some(opts) = incoming.unique_opts.clone() {
        if let Some(debounce) = opts.debounce {
            incoming.next_run_at = Some(now + chrono::Duration::milliseconds(debounce.delay_ms));
            incoming.debounce_started_at = Some(now);
        }
    }
    incoming
}

/// Stamps audit metadata, persists via the repository, and feeds the
/// on-the-fly lock path when the result is due before the processor's next
/// scheduled scan.
pub struct SaveOrchestrator {
    repo: Arc<dyn Repository>,
    writer_identity: String,
    processor: ProcessorHandle,
}

impl SaveOrchestrator {
    pub fn new(repo: Arc<dyn Repository>, writer_identity: String, processor: ProcessorHandle) -> Self {
        Self { repo, writer_identity, processor }
    }

    pub async fn save(&self, mut job: Job) -> anyhow::Result<Job> {
        job.last_modified_by = Some(self.writer_identity.clone());
        let audit = AuditInfo { last_modified_by: Some(self.writer_identity.as_str()) };
        let saved = self.repo.save_job(job, audit).await?;

        if let (Some(id), Some(next_run_at)) = (saved.id, saved.next_run_at) {
            let next_scan_at = self.processor.next_scan_at_millis.load(Ordering::Relaxed);
            if next_scan_at != i64::MAX && next_run_at.timestamp_millis() <= next_scan_at {
                self.processor.notify_saved(id);
            }
        }

        Ok(saved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{DebounceConfig, UniqueOpts};
    use serde_json::json;
    use uuid::Uuid;

    fn job(name: &str) -> Job {
        Job::new(name, json!({}))
    }

    #[test]
    fn insert_when_nothing_exists() {
        let decision = resolve_save(None, job("x"), Utc::now());
        assert!(matches!(decision, SaveDecision::Write(_)));
    }

    #[test]
    fn singleton_preserves_due_existing_next_run_at() {
        let now = Utc::now();
        let mut existing = job("daily");
        existing.id = Some(Uuid::new_v4());
        existing.job_type = JobType::Single;
        existing.next_run_at = Some(now - chrono::Duration::minutes(1));

        let mut incoming = job("daily");
        incoming.job_type = JobType::Single;
        incoming.next_run_at = Some(now + chrono::Duration::days(1));

        match resolve_save(Some(existing.clone()), incoming, now) {
            SaveDecision::Write(saved) => {
                assert_eq!(saved.id, existing.id);
                assert_eq!(saved.next_run_at, existing.next_run_at);
            }
            _ => panic!("expected Write"),
        }
    }

    #[test]
    fn singleton_preserves_future_next_run_at_on_resubmission() {
        let now = Utc::now();
        let mut existing = job("daily");
        existing.id = Some(Uuid::new_v4());
        existing.job_type = JobType::Single;
        existing.next_run_at = Some(now + chrono::Duration::hours(2));

        let mut incoming = job("daily");
        incoming.job_type = JobType::Single;
        incoming.next_run_at = Some(now + chrono::Duration::hours(5));

        match resolve_save(Some(existing.clone()), incoming, now) {
            SaveDecision::Write(saved) => assert_eq!(saved.next_run_at, existing.next_run_at),
            _ => panic!("expected Write"),
        }
    }

    #[test]
    fn insert_only_unique_is_a_noop_when_existing() {
        let now = Utc::now();
        let mut existing = job("once");
        existing.id = Some(Uuid::new_v4());

        let mut incoming = job("once");
        incoming.unique_opts = Some(UniqueOpts { insert_only: true, debounce: None });

        match resolve_save(Some(existing.clone()), incoming, now) {
            SaveDecision::NoOp(returned) => assert_eq!(returned.id, existing.id),
            _ => panic!("expected NoOp"),
        }
    }

    #[test]
    fn debounce_trailing_resets_next_run_at_and_keeps_started_at() {
        let started = Utc::now() - chrono::Duration::milliseconds(150);
        let now = Utc::now();
        let mut existing = job("idx");
        existing.id = Some(Uuid::new_v4());
        existing.debounce_started_at = Some(started);
        existing.next_run_at = Some(started + chrono::Duration::milliseconds(200));

        let mut incoming = job("idx");
        incoming.unique_opts = Some(UniqueOpts {
            insert_only: false,
            debounce: Some(DebounceConfig { delay_ms: 200, max_wait_ms: None, strategy: DebounceStrategy::Trailing }),
        });

        match resolve_save(Some(existing), incoming, now) {
            SaveDecision::Write(saved) => {
                assert_eq!(saved.debounce_started_at, Some(started));
                assert_eq!(saved.next_run_at, Some(now + chrono::Duration::milliseconds(200)));
            }
            _ => panic!("expected Write"),
        }
    }

    #[test]
    fn debounce_trailing_forces_execution_past_max_wait() {
        let started = Utc::now() - chrono::Duration::milliseconds(500);
        let now = Utc::now();
        let mut existing = job("idx");
        existing.id = Some(Uuid::new_v4());
        existing.debounce_started_at = Some(started);
        existing.next_run_at = Some(now - chrono::Duration::milliseconds(10));

        let mut incoming = job("idx");
        incoming.unique_opts = Some(UniqueOpts {
            insert_only: false,
            debounce: Some(DebounceConfig { delay_ms: 200, max_wait_ms: Some(400), strategy: DebounceStrategy::Trailing }),
        });

        match resolve_save(Some(existing.clone()), incoming, now) {
            SaveDecision::Write(saved) => assert_eq!(saved.next_run_at, existing.next_run_at),
            _ => panic!("expected Write"),
        }
    }

    #[test]
    fn debounce_leading_leaves_existing_untouched() {
        let now = Utc::now();
        let mut existing = job("idx");
        existing.id = Some(Uuid::new_v4());
        existing.next_run_at = Some(now + chrono::Duration::milliseconds(50));

        let mut incoming = job("idx");
        incoming.unique_opts = Some(UniqueOpts {
            insert_only: false,
            debounce: Some(DebounceConfig { delay_ms: 200, max_wait_ms: None, strategy: DebounceStrategy::Leading }),
        });

        match resolve_save(Some(existing.clone()), incoming, now) {
            SaveDecision::Write(saved) => assert_eq!(saved.next_run_at, existing.next_run_at),
            _ => panic!("expected Write"),
        }
    }

    #[test]
    fn initial_debounce_save_sets_delay_and_started_at() {
        let now = Utc::now();
        let mut incoming = job("idx");
        incoming.unique_opts = Some(UniqueOpts {
            insert_only: false,
            debounce: Some(DebounceConfig { delay_ms: 200, max_wait_ms: None, strategy: DebounceStrategy::Trailing }),
        });
        let saved = initial_debounce_save(incoming, now);
        assert_eq!(saved.next_run_at, Some(now + chrono::Duration::milliseconds(200)));
        assert_eq!(saved.debounce_started_at, Some(now));
    }
}
