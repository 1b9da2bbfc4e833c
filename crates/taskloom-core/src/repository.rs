//! Repository contract, spec.md §6.1 / §4.7.
//!
//! The only place distributed concurrency control lives. Implemented by
//! external drivers (`taskloom-postgres`, `taskloom-testing`'s in-memory
//! double); the core never assumes a particular datastore.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::job::{Job, JobId, JobState};

#[derive(Debug, Clone, Copy, Default)]
pub struct AuditInfo<'a> {
    pub last_modified_by: Option<&'a str>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortField {
    NextRunAt,
    Priority,
    LastRunAt,
    Name,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Asc,
    Desc,
}

#[derive(Debug, Clone, Copy)]
pub struct Sort {
    pub field: SortField,
    pub direction: SortDirection,
}

impl Default for Sort {
    /// Default sort is `nextRunAt asc, priority desc`, spec.md §4.5.
    fn default() -> Self {
        Sort { field: SortField::NextRunAt, direction: SortDirection::Asc }
    }
}

#[derive(Debug, Clone, Default)]
pub struct QueryFilter {
    pub name: Option<String>,
    pub names: Vec<String>,
    pub state: Option<JobState>,
    pub id: Option<JobId>,
    pub ids: Vec<JobId>,
    pub search: Option<String>,
    pub data: Option<Value>,
    pub include_disabled: Option<bool>,
    pub sort: Option<Sort>,
    pub skip: Option<u64>,
    pub limit: Option<u64>,
}

#[derive(Debug, Clone, Default)]
pub struct RemoveFilter {
    pub id: Option<JobId>,
    pub ids: Vec<JobId>,
    pub name: Option<String>,
    pub names: Vec<String>,
    pub not_names: Vec<String>,
    pub data: Option<Value>,
}

#[derive(Debug, Clone)]
pub struct QueryResult {
    pub jobs: Vec<Job>,
    pub total: u64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct JobsOverviewRow {
    pub total: u64,
    pub running: u64,
    pub scheduled: u64,
    pub queued: u64,
    pub completed: u64,
    pub failed: u64,
    pub repeating: u64,
}

#[derive(Debug, Clone)]
pub struct JobsOverview {
    pub name: String,
    pub counts: JobsOverviewRow,
}

/// Abstract persistence for jobs. All methods must be atomic with respect to
/// the fields they read and write — see spec.md §4.7 for the two operations
/// ( `get_next_job_to_run`, `lock_job` ) that carry the distributed-locking
/// guarantee.
#[async_trait]
pub trait Repository: Send + Sync {
    async fn connect(&self) -> anyhow::Result<()>;

    /// Upsert semantics per spec.md §4.4 are implemented here; the save
    /// orchestrator (`crate::save`) decides *which* call shape to use, this
    /// method performs it atomically.
    async fn save_job(&self, job: Job, audit: AuditInfo<'_>) -> anyhow::Result<Job>;

    /// Persists only the mutable run-state fields named in spec.md §6.1.
    async fn save_job_state(&self, job: &Job, audit: AuditInfo<'_>) -> anyhow::Result<()>;

    /// Atomic compare-and-set: `{id, lockedAt:null, nextRunAt:=expected,
    /// disabled≠true}` -> `lockedAt=now`.
    async fn lock_job(&self, job: &Job, audit: AuditInfo<'_>) -> anyhow::Result<Option<Job>>;

    async fn unlock_job(&self, id: JobId) -> anyhow::Result<()>;
    async fn unlock_jobs(&self, ids: &[JobId]) -> anyhow::Result<()>;

    /// Atomically selects and locks at most one due, unlocked-or-expired job
    /// for `name`, per the filter in spec.md §4.5.
    async fn get_next_job_to_run(
        &self,
        name: &str,
        next_scan_at: DateTime<Utc>,
        lock_deadline: DateTime<Utc>,
        now: DateTime<Utc>,
        audit: AuditInfo<'_>,
    ) -> anyhow::Result<Option<Job>>;

    async fn get_job_by_id(&self, id: JobId) -> anyhow::Result<Option<Job>>;

    async fn query_jobs(&self, opts: QueryFilter) -> anyhow::Result<QueryResult>;

    async fn remove_jobs(&self, opts: RemoveFilter) -> anyhow::Result<u64>;

    async fn get_distinct_job_names(&self) -> anyhow::Result<Vec<String>>;

    async fn get_jobs_overview(&self) -> anyhow::Result<Vec<JobsOverview>>;

    /// Count of jobs where `nextRunAt <= now`.
    async fn get_queue_size(&self, now: DateTime<Utc>) -> anyhow::Result<u64>;
}
