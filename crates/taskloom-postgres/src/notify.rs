//! Cross-process notification channel over Postgres `LISTEN`/`NOTIFY`
//! (spec.md §6.2) — the "advisory, lossy" transport the save orchestrator
//! and processor treat as a hint, never a source of truth.

use std::sync::Mutex as StdMutex;
use std::sync::Arc;

use async_trait::async_trait;
use sqlx::postgres::PgListener;
use sqlx::PgPool;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use taskloom_core::{
    ChannelState, JobNotification, JobNotificationHandler, JobStateHandler, JobStateNotification,
    NotificationChannel,
};

const JOB_CHANNEL: &str = "taskloom_job_saved";
const STATE_CHANNEL: &str = "taskloom_job_state";

pub struct PgNotificationChannel {
    pool: PgPool,
    state: Arc<StdMutex<ChannelState>>,
    job_handlers: Arc<Mutex<Vec<JobNotificationHandler>>>,
    state_handlers: Arc<Mutex<Vec<JobStateHandler>>>,
    listener_task: StdMutex<Option<JoinHandle<()>>>,
}

impl PgNotificationChannel {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            state: Arc::new(StdMutex::new(ChannelState::Disconnected)),
            job_handlers: Arc::new(Mutex::new(Vec::new())),
            state_handlers: Arc::new(Mutex::new(Vec::new())),
            listener_task: StdMutex::new(None),
        }
    }
}

#[async_trait]
impl NotificationChannel for PgNotificationChannel {
    async fn connect(&self) -> anyhow::Result<()> {
        *self.state.lock().unwrap() = ChannelState::Connecting;
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(JOB_CHANNEL).await?;
        listener.listen(STATE_CHANNEL).await?;

        let job_handlers = self.job_handlers.clone();
        let state_handlers = self.state_handlers.clone();
        let state = self.state.clone();
        *state.lock().unwrap() = ChannelState::Connected;

        let task = tokio::spawn(async move {
            loop {
                match listener.recv().await {
                    Ok(notification) => {
                        let payload = notification.payload();
                        match notification.channel() {
                            JOB_CHANNEL => match serde_json::from_str::<JobNotification>(payload) {
                                Ok(n) => {
                                    for h in job_handlers.lock().await.iter() {
                                        h(n.clone());
                                    }
                                }
                                Err(e) => warn!(error = %e, "malformed job notification payload"),
                            },
                            STATE_CHANNEL => match serde_json::from_str::<JobStateNotification>(payload) {
                                Ok(n) => {
                                    for h in state_handlers.lock().await.iter() {
                                        h(n.clone());
                                    }
                                }
                                Err(e) => warn!(error = %e, "malformed job-state notification payload"),
                            },
                            other => debug!(channel = other, "ignoring notification on unknown channel"),
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "notification listener disconnected");
                        *state.lock().unwrap() = ChannelState::Reconnecting;
                        break;
                    }
                }
            }
        });
        *self.listener_task.lock().unwrap() = Some(task);
        Ok(())
    }

    async fn disconnect(&self) -> anyhow::Result<()> {
        if let Some(task) = self.listener_task.lock().unwrap().take() {
            task.abort();
        }
        *self.state.lock().unwrap() = ChannelState::Disconnected;
        Ok(())
    }

    fn state(&self) -> ChannelState {
        *self.state.lock().unwrap()
    }

    async fn subscribe(&self, handler: JobNotificationHandler) -> anyhow::Result<()> {
        self.job_handlers.lock().await.push(handler);
        Ok(())
    }

    async fn publish(&self, notification: JobNotification) -> anyhow::Result<()> {
        let payload = serde_json::to_string(&notification)?;
        sqlx::query("SELECT pg_notify($1, $2)").bind(JOB_CHANNEL).bind(payload).execute(&self.pool).await?;
        Ok(())
    }

    async fn subscribe_state(&self, handler: JobStateHandler) -> anyhow::Result<()> {
        self.state_handlers.lock().await.push(handler);
        Ok(())
    }

    async fn publish_state(&self, notification: JobStateNotification) -> anyhow::Result<()> {
        let payload = serde_json::to_string(&notification)?;
        sqlx::query("SELECT pg_notify($1, $2)").bind(STATE_CHANNEL).bind(payload).execute(&self.pool).await?;
        Ok(())
    }
}

