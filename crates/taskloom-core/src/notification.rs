//! Notification channel contract, spec.md §6.2 — optional pub/sub used to
//! replace polling with push-based wakeups.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::job::JobId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Error,
}

/// Hint that a job was saved and may be due; subscribers treat it as an
/// invitation to attempt an on-the-fly lock, not a guarantee (spec.md §5:
/// "advisory... even if lost, the next polling tick will pick it up").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobNotification {
    pub job_id: JobId,
    pub job_name: String,
    pub next_run_at: Option<DateTime<Utc>>,
    pub priority: i32,
    pub timestamp: DateTime<Utc>,
    pub source: Uuid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStateKind {
    Start,
    Progress,
    Success,
    Fail,
    Complete,
    Retry,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStateNotification {
    pub job_id: JobId,
    pub job_name: String,
    pub kind: JobStateKind,
    pub progress: Option<u8>,
    pub error: Option<String>,
    pub fail_count: Option<u32>,
    pub retry_at: Option<DateTime<Utc>>,
    pub retry_attempt: Option<u32>,
    pub duration_ms: Option<i64>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_finished_at: Option<DateTime<Utc>>,
    pub timestamp: DateTime<Utc>,
    pub source: Uuid,
}

pub type JobNotificationHandler = Box<dyn Fn(JobNotification) + Send + Sync>;
pub type JobStateHandler = Box<dyn Fn(JobStateNotification) + Send + Sync>;

/// Optional transport for cross-process "job saved" hints and lifecycle
/// events. Handlers must not block the caller's loop for long — forward
/// work onto the processor instead (spec.md §5).
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    async fn connect(&self) -> anyhow::Result<()>;
    async fn disconnect(&self) -> anyhow::Result<()>;
    fn state(&self) -> ChannelState;

    async fn subscribe(&self, handler: JobNotificationHandler) -> anyhow::Result<()>;
    async fn publish(&self, notification: JobNotification) -> anyhow::Result<()>;

    async fn subscribe_state(&self, _handler: JobStateHandler) -> anyhow::Result<()> {
        Ok(())
    }
    async fn publish_state(&self, _notification: JobStateNotification) -> anyhow::Result<()> {
        Ok(())
    }
}
