//! Defines two jobs — a one-off welcome email and a recurring digest — and
//! runs them against the in-memory driver until both have fired at least
//! once, then drains and stops cleanly.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use taskloom_core::{DefineOptions, EveryOptions, Handler, JobContext, Scheduler};
use taskloom_testing::MemoryRepository;
use tracing::info;

fn async_handler<F>(f: F) -> Handler
where
    F: Fn(JobContext) -> anyhow::Result<()> + Send + Sync + 'static,
{
    Handler::Async(Arc::new(move |ctx| {
        let result = f(ctx);
        Box::pin(async move { result })
    }))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let repo: Arc<dyn taskloom_core::Repository> = Arc::new(MemoryRepository::new());
    let digest_runs = Arc::new(AtomicUsize::new(0));
    let runs_for_handler = digest_runs.clone();

    let scheduler = Scheduler::builder(repo)
        .define(
            "welcome-email",
            async_handler(|ctx| {
                info!(job = %ctx.job.name, data = %ctx.job.data, "sending welcome email");
                Ok(())
            }),
            DefineOptions::default(),
        )
        .define(
            "digest",
            async_handler(move |ctx| {
                let count = runs_for_handler.fetch_add(1, Ordering::SeqCst) + 1;
                info!(job = %ctx.job.name, run = count, "compiling digest");
                Ok(())
            }),
            DefineOptions::default(),
        )
        .start()
        .await?;

    scheduler.now("welcome-email", json!({"to": "new-user@example.com"})).await?;
    scheduler
        .every("2 seconds", "digest", json!({}), EveryOptions::default())
        .await?;

    while digest_runs.load(Ordering::SeqCst) < 3 {
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    let overview = scheduler.get_jobs_overview().await?;
    for row in &overview {
        info!(name = %row.name, "job overview: {:?}", row);
    }

    scheduler.drain(Some(Duration::from_secs(2))).await?;
    scheduler.stop(true).await?;
    Ok(())
}
