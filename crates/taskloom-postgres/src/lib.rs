//! PostgreSQL-backed [`Repository`] and [`NotificationChannel`].
//!
//! # Schema
//!
//! ```sql
//! CREATE TABLE taskloom_jobs (
//!     id                  UUID PRIMARY KEY,
//!     name                TEXT NOT NULL,
//!     job_type            TEXT NOT NULL,
//!     data                JSONB NOT NULL,
//!     priority            INTEGER NOT NULL DEFAULT 0,
//!     next_run_at         TIMESTAMPTZ,
//!     locked_at           TIMESTAMPTZ,
//!     last_run_at         TIMESTAMPTZ,
//!     last_finished_at    TIMESTAMPTZ,
//!     failed_at           TIMESTAMPTZ,
//!     fail_count          INTEGER NOT NULL DEFAULT 0,
//!     fail_reason         TEXT,
//!     repeat_interval     TEXT,
//!     repeat_timezone     TEXT,
//!     repeat_at           TEXT,
//!     start_date          TIMESTAMPTZ,
//!     end_date            TIMESTAMPTZ,
//!     skip_days           SMALLINT[] NOT NULL DEFAULT '{}',
//!     disabled            BOOLEAN NOT NULL DEFAULT FALSE,
//!     unique_key          JSONB,
//!     unique_opts         JSONB,
//!     debounce_started_at TIMESTAMPTZ,
//!     progress            SMALLINT,
//!     last_modified_by    TEXT
//! );
//! CREATE UNIQUE INDEX taskloom_jobs_singleton ON taskloom_jobs (name) WHERE job_type = 'single';
//! CREATE INDEX taskloom_jobs_ready ON taskloom_jobs (name, priority DESC, next_run_at ASC)
//!     WHERE locked_at IS NULL AND disabled = FALSE;
//! ```
//!
//! `save_job` is the only method that needs more than a single statement: it
//! looks up whatever record might already occupy the relevant slot (by id,
//! by the `{name, type=single}` singleton key, or by the `unique` tuple)
//! inside a `FOR UPDATE` transaction, hands the pair to
//! [`taskloom_core::resolve_save`], and `INSERT ... ON CONFLICT (id) DO
//! UPDATE`s the result. Locking uses the same `FOR UPDATE SKIP LOCKED`
//! claim-row pattern as `get_next_job_to_run`.

mod notify;

pub use notify::PgNotificationChannel;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

use taskloom_core::{
    initial_debounce_save, resolve_save, AuditInfo, Job, JobId, JobState, JobType, JobsOverview,
    JobsOverviewRow, QueryFilter, QueryResult, RemoveFilter, Repository, SaveDecision, SkipDays,
    Sort, SortDirection, SortField, UniqueOpts,
};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS taskloom_jobs (
    id                  UUID PRIMARY KEY,
    name                TEXT NOT NULL,
    job_type            TEXT NOT NULL,
    data                JSONB NOT NULL,
    priority            INTEGER NOT NULL DEFAULT 0,
    next_run_at         TIMESTAMPTZ,
    locked_at           TIMESTAMPTZ,
    last_run_at         TIMESTAMPTZ,
    last_finished_at    TIMESTAMPTZ,
    failed_at           TIMESTAMPTZ,
    fail_count          INTEGER NOT NULL DEFAULT 0,
    fail_reason         TEXT,
    repeat_interval     TEXT,
    repeat_timezone     TEXT,
    repeat_at           TEXT,
    start_date          TIMESTAMPTZ,
    end_date            TIMESTAMPTZ,
    skip_days           SMALLINT[] NOT NULL DEFAULT '{}',
    disabled            BOOLEAN NOT NULL DEFAULT FALSE,
    unique_key          JSONB,
    unique_opts         JSONB,
    debounce_started_at TIMESTAMPTZ,
    progress            SMALLINT,
    last_modified_by    TEXT
);
CREATE UNIQUE INDEX IF NOT EXISTS taskloom_jobs_singleton ON taskloom_jobs (name) WHERE job_type = 'single';
CREATE INDEX IF NOT EXISTS taskloom_jobs_ready ON taskloom_jobs (name, priority DESC, next_run_at ASC)
    WHERE locked_at IS NULL AND disabled = FALSE;
"#;

#[derive(Clone)]
pub struct PgRepository {
    pool: PgPool,
}

impl PgRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn job_type_str(t: JobType) -> &'static str {
    match t {
        JobType::Normal => "normal",
        JobType::Single => "single",
    }
}

fn parse_job_type(s: &str) -> JobType {
    if s == "single" {
        JobType::Single
    } else {
        JobType::Normal
    }
}

fn row_to_job(row: &PgRow) -> anyhow::Result<Job> {
    let skip_days_raw: Vec<i16> = row.try_get("skip_days")?;
    let unique_key: Option<serde_json::Value> = row.try_get("unique_key")?;
    let unique_opts_json: Option<serde_json::Value> = row.try_get("unique_opts")?;

    Ok(Job {
        id: Some(row.try_get("id")?),
        name: row.try_get("name")?,
        job_type: parse_job_type(row.try_get::<String, _>("job_type")?.as_str()),
        data: row.try_get("data")?,
        priority: row.try_get("priority")?,
        next_run_at: row.try_get("next_run_at")?,
        locked_at: row.try_get("locked_at")?,
        last_run_at: row.try_get("last_run_at")?,
        last_finished_at: row.try_get("last_finished_at")?,
        failed_at: row.try_get("failed_at")?,
        fail_count: row.try_get::<i32, _>("fail_count")? as u32,
        fail_reason: row.try_get("fail_reason")?,
        repeat_interval: row.try_get("repeat_interval")?,
        repeat_timezone: row.try_get("repeat_timezone")?,
        repeat_at: row.try_get("repeat_at")?,
        start_date: row.try_get("start_date")?,
        end_date: row.try_get("end_date")?,
        skip_days: SkipDays(skip_days_raw.into_iter().map(|d| d as u8).collect()),
        disabled: row.try_get("disabled")?,
        unique: unique_key.and_then(|v| v.as_object().cloned()),
        unique_opts: unique_opts_json.and_then(|v| serde_json::from_value::<UniqueOpts>(v).ok()),
        debounce_started_at: row.try_get("debounce_started_at")?,
        progress: row.try_get::<Option<i16>, _>("progress")?.map(|p| p as u8),
        last_modified_by: row.try_get("last_modified_by")?,
    })
}

/// `INSERT ... ON CONFLICT (id) DO UPDATE` for whichever record
/// [`taskloom_core::resolve_save`] decided to persist. `job.id` is always
/// `Some` by the time this runs.
async fn upsert(tx: &mut Transaction<'_, Postgres>, job: &Job) -> anyhow::Result<()> {
    let skip_days: Vec<i16> = job.skip_days.0.iter().map(|d| *d as i16).collect();
    let unique_key = job.unique.clone().map(serde_json::Value::Object);
    let unique_opts = job.unique_opts.as_ref().map(|o| serde_json::to_value(o)).transpose()?;

    sqlx::query(
        r#"
        INSERT INTO taskloom_jobs (
            id, name, job_type, data, priority, next_run_at, locked_at, last_run_at,
            last_finished_at, failed_at, fail_count, fail_reason, repeat_interval,
            repeat_timezone, repeat_at, start_date, end_date, skip_days, disabled,
            unique_key, unique_opts, debounce_started_at, progress, last_modified_by
        ) VALUES (
            $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17,
            $18, $19, $20, $21, $22, $23, $24
        )
        ON CONFLICT (id) DO UPDATE SET
            name = EXCLUDED.name, job_type = EXCLUDED.job_type, data = EXCLUDED.data,
            priority = EXCLUDED.priority, next_run_at = EXCLUDED.next_run_at,
            locked_at = EXCLUDED.locked_at, last_run_at = EXCLUDED.last_run_at,
            last_finished_at = EXCLUDED.last_finished_at, failed_at = EXCLUDED.failed_at,
            fail_count = EXCLUDED.fail_count, fail_reason = EXCLUDED.fail_reason,
            repeat_interval = EXCLUDED.repeat_interval, repeat_timezone = EXCLUDED.repeat_timezone,
            repeat_at = EXCLUDED.repeat_at, start_date = EXCLUDED.start_date,
            end_date = EXCLUDED.end_date, skip_days = EXCLUDED.skip_days,
            disabled = EXCLUDED.disabled, unique_key = EXCLUDED.unique_key,
            unique_opts = EXCLUDED.unique_opts, debounce_started_at = EXCLUDED.debounce_started_at,
            progress = EXCLUDED.progress, last_modified_by = EXCLUDED.last_modified_by
        "#,
    )
    .bind(job.id.expect("id assigned before upsert"))
    .bind(&job.name)
    .bind(job_type_str(job.job_type))
    .bind(&job.data)
    .bind(job.priority)
    .bind(job.next_run_at)
    .bind(job.locked_at)
    .bind(job.last_run_at)
    .bind(job.last_finished_at)
    .bind(job.failed_at)
    .bind(job.fail_count as i32)
    .bind(&job.fail_reason)
    .bind(&job.repeat_interval)
    .bind(&job.repeat_timezone)
    .bind(&job.repeat_at)
    .bind(job.start_date)
    .bind(job.end_date)
    .bind(skip_days)
    .bind(job.disabled)
    .bind(unique_key)
    .bind(unique_opts)
    .bind(job.debounce_started_at)
    .bind(job.progress.map(|p| p as i16))
    .bind(&job.last_modified_by)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn fetch_existing(tx: &mut Transaction<'_, Postgres>, job: &Job) -> anyhow::Result<Option<Job>> {
    let row = if let Some(id) = job.id {
        sqlx::query("SELECT * FROM taskloom_jobs WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut **tx)
            .await?
    } else if job.job_type == JobType::Single {
        sqlx::query("SELECT * FROM taskloom_jobs WHERE name = $1 AND job_type = 'single' FOR UPDATE")
            .bind(&job.name)
            .fetch_optional(&mut **tx)
            .await?
    } else if let Some(key) = &job.unique {
        let value = serde_json::Value::Object(key.clone());
        sqlx::query("SELECT * FROM taskloom_jobs WHERE unique_key = $1::jsonb FOR UPDATE")
            .bind(value)
            .fetch_optional(&mut **tx)
            .await?
    } else {
        None
    };
    row.as_ref().map(row_to_job).transpose()
}

#[async_trait]
impl Repository for PgRepository {
    async fn connect(&self) -> anyhow::Result<()> {
        for statement in SCHEMA.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn save_job(&self, job: Job, _audit: AuditInfo<'_>) -> anyhow::Result<Job> {
        let mut tx = self.pool.begin().await?;
        let existing = fetch_existing(&mut tx, &job).await?;
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
                if job.id.is_none() {
                    job.id = Some(Uuid::new_v4());
                }
                upsert(&mut tx, &job).await?;
                job
            }
        };

        tx.commit().await?;
        Ok(result)
    }

    async fn save_job_state(&self, job: &Job, _audit: AuditInfo<'_>) -> anyhow::Result<()> {
        let id = job.id.ok_or_else(|| anyhow::anyhow!("job has no id"))?;
        sqlx::query(
            r#"
            UPDATE taskloom_jobs SET
                next_run_at = $2, locked_at = $3, last_run_at = $4, last_finished_at = $5,
                failed_at = $6, fail_count = $7, fail_reason = $8, progress = $9,
                repeat_interval = $10, repeat_at = $11
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(job.next_run_at)
        .bind(job.locked_at)
        .bind(job.last_run_at)
        .bind(job.last_finished_at)
        .bind(job.failed_at)
        .bind(job.fail_count as i32)
        .bind(&job.fail_reason)
        .bind(job.progress.map(|p| p as i16))
        .bind(&job.repeat_interval)
        .bind(&job.repeat_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn lock_job(&self, job: &Job, _audit: AuditInfo<'_>) -> anyhow::Result<Option<Job>> {
        let id = job.id.ok_or_else(|| anyhow::anyhow!("job has no id"))?;
        let row = sqlx::query(
            r#"
            UPDATE taskloom_jobs SET locked_at = NOW()
            WHERE id = $1 AND locked_at IS NULL AND next_run_at = $2 AND disabled = FALSE
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(job.next_run_at)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_job).transpose()
    }

    async fn unlock_job(&self, id: JobId) -> anyhow::Result<()> {
        sqlx::query("UPDATE taskloom_jobs SET locked_at = NULL WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn unlock_jobs(&self, ids: &[JobId]) -> anyhow::Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        sqlx::query("UPDATE taskloom_jobs SET locked_at = NULL WHERE id = ANY($1)")
            .bind(ids)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// `FOR UPDATE SKIP LOCKED` claim: a due, unlocked-or-expired job for
    /// `name`, oldest-priority-first.
    async fn get_next_job_to_run(
        &self,
        name: &str,
        next_scan_at: DateTime<Utc>,
        lock_deadline: DateTime<Utc>,
        now: DateTime<Utc>,
        _audit: AuditInfo<'_>,
    ) -> anyhow::Result<Option<Job>> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(
            r#"
            SELECT * FROM taskloom_jobs
            WHERE name = $1
              AND disabled = FALSE
              AND (
                (locked_at IS NULL AND next_run_at <= $2)
                OR locked_at < $3
              )
            ORDER BY priority DESC, next_run_at ASC
            LIMIT 1
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(name)
        .bind(next_scan_at)
        .bind(lock_deadline)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            tx.commit().await?;
            return Ok(None);
        };
        let id: Uuid = row.try_get("id")?;
        sqlx::query("UPDATE taskloom_jobs SET locked_at = $2 WHERE id = $1")
            .bind(id)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        let mut job = row_to_job(&row)?;
        job.locked_at = Some(now);
        tx.commit().await?;
        Ok(Some(job))
    }

    async fn get_job_by_id(&self, id: JobId) -> anyhow::Result<Option<Job>> {
        let row = sqlx::query("SELECT * FROM taskloom_jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_job).transpose()
    }

    async fn query_jobs(&self, opts: QueryFilter) -> anyhow::Result<QueryResult> {
        // `state` is derived, not stored; the facade filters by it after
        // this call returns, so it is intentionally not translated to SQL
        // here.
        let sort = opts.sort.unwrap_or_default();
        let order_column = match sort.field {
            SortField::NextRunAt => "next_run_at",
            SortField::Priority => "priority",
            SortField::LastRunAt => "last_run_at",
            SortField::Name => "name",
        };
        let direction = match sort.direction {
            SortDirection::Asc => "ASC",
            SortDirection::Desc => "DESC",
        };

        let mut qb = sqlx::QueryBuilder::<Postgres>::new("SELECT * FROM taskloom_jobs WHERE TRUE");
        if let Some(name) = &opts.name {
            qb.push(" AND name = ").push_bind(name.clone());
        }
        if !opts.names.is_empty() {
            qb.push(" AND name = ANY(").push_bind(opts.names.clone()).push(")");
        }
        if let Some(id) = opts.id {
            qb.push(" AND id = ").push_bind(id);
        }
        if !opts.ids.is_empty() {
            qb.push(" AND id = ANY(").push_bind(opts.ids.clone()).push(")");
        }
        if let Some(search) = &opts.search {
            qb.push(" AND name ILIKE ").push_bind(format!("%{search}%"));
        }
        if opts.include_disabled != Some(true) {
            qb.push(" AND disabled = FALSE");
        }
        qb.push(format!(" ORDER BY {order_column} {direction}"));
        if let Some(limit) = opts.limit {
            qb.push(" LIMIT ").push_bind(limit as i64);
        }
        if let Some(skip) = opts.skip {
            qb.push(" OFFSET ").push_bind(skip as i64);
        }

        let rows = qb.build().fetch_all(&self.pool).await?;
        let jobs = rows.iter().map(row_to_job).collect::<anyhow::Result<Vec<_>>>()?;
        let total = jobs.len() as u64;
        Ok(QueryResult { jobs, total })
    }

    async fn remove_jobs(&self, opts: RemoveFilter) -> anyhow::Result<u64> {
        if let Some(id) = opts.id {
            let result = sqlx::query("DELETE FROM taskloom_jobs WHERE id = $1").bind(id).execute(&self.pool).await?;
            return Ok(result.rows_affected());
        }
        if !opts.ids.is_empty() {
            let result = sqlx::query("DELETE FROM taskloom_jobs WHERE id = ANY($1)").bind(&opts.ids).execute(&self.pool).await?;
            return Ok(result.rows_affected());
        }
        if let Some(name) = &opts.name {
            let result = sqlx::query("DELETE FROM taskloom_jobs WHERE name = $1").bind(name).execute(&self.pool).await?;
            return Ok(result.rows_affected());
        }
        if !opts.names.is_empty() {
            let result = sqlx::query("DELETE FROM taskloom_jobs WHERE name = ANY($1)").bind(&opts.names).execute(&self.pool).await?;
            return Ok(result.rows_affected());
        }
        if !opts.not_names.is_empty() {
            let result = sqlx::query("DELETE FROM taskloom_jobs WHERE NOT (name = ANY($1))").bind(&opts.not_names).execute(&self.pool).await?;
            return Ok(result.rows_affected());
        }
        Ok(0)
    }

    async fn get_distinct_job_names(&self) -> anyhow::Result<Vec<String>> {
        let rows = sqlx::query("SELECT DISTINCT name FROM taskloom_jobs").fetch_all(&self.pool).await?;
        rows.iter().map(|r| r.try_get::<String, _>("name").map_err(Into::into)).collect()
    }

    async fn get_jobs_overview(&self) -> anyhow::Result<Vec<JobsOverview>> {
        let names = self.get_distinct_job_names().await?;
        let now = Utc::now();
        let mut out = Vec::with_capacity(names.len());
        for name in names {
            let rows = sqlx::query("SELECT * FROM taskloom_jobs WHERE name = $1").bind(&name).fetch_all(&self.pool).await?;
            let mut counts = JobsOverviewRow::default();
            for row in &rows {
                let job = row_to_job(row)?;
                counts.total += 1;
                match taskloom_core::derive_state(&job, now) {
                    JobState::Running => counts.running += 1,
                    JobState::Scheduled => counts.scheduled += 1,
                    JobState::Queued => counts.queued += 1,
                    JobState::Completed => counts.completed += 1,
                    JobState::Failed => counts.failed += 1,
                    JobState::Repeating => counts.repeating += 1,
                }
            }
            out.push(JobsOverview { name, counts });
        }
        Ok(out)
    }

    async fn get_queue_size(&self, now: DateTime<Utc>) -> anyhow::Result<u64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM taskloom_jobs WHERE next_run_at <= $1 AND locked_at IS NULL")
            .bind(now)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get::<i64, _>("n")? as u64)
    }
}
