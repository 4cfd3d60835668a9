//! Demo of the background task scheduler.
//!
//! Submits a reminder timer, a low-priority batch job and a high-priority
//! timer, logs lifecycle events as they happen and prints final stats.
//! Configuration is read from the default config path when present.

use fae_tasks::actions::{BatchAction, TimerAction};
use fae_tasks::{Listener, TaskScheduler, TaskSchedulerConfig};
use serde_json::json;
use std::time::Duration;

async fn word_length(word: &'static str) -> anyhow::Result<serde_json::Value> {
    anyhow::ensure!(!word.is_empty(), "empty word");
    Ok(json!({ "word": word, "length": word.len() }))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let path = TaskSchedulerConfig::default_config_path();
    let config = if path.exists() {
        TaskSchedulerConfig::from_file(&path)?
    } else {
        TaskSchedulerConfig::default()
    };
    tracing::info!(
        max_concurrent = config.max_concurrent,
        tick_ms = config.tick_interval_ms,
        "fae-tasks demo starting"
    );

    let scheduler = TaskScheduler::new(config);
    scheduler.add_listener(Listener::sync(|task, kind| {
        tracing::info!(task_id = %task.id, name = %task.name, event = %kind, "task event");
        Ok(())
    }));
    let handle = scheduler.run()?;

    let ids = [
        scheduler.submit(
            "Tea reminder",
            TimerAction::new(Duration::from_secs(2), "Your tea is ready"),
            50,
        ),
        scheduler.submit(
            "Word lengths",
            BatchAction::new(vec!["alpha", "beta", "", "delta"], word_length)
                .with_delay(Duration::from_millis(200)),
            1,
        ),
        scheduler.submit(
            "Stand up",
            TimerAction::new(Duration::from_secs(1), "Time to stretch"),
            100,
        ),
    ];

    for id in ids {
        if let Some(task) = scheduler.wait(id).await {
            tracing::info!(
                name = %task.name,
                state = %task.state,
                run_ms = task.run_duration().map(|d| d.num_milliseconds()),
                result = ?task.result,
                "task done"
            );
        }
    }

    tracing::info!("{}", scheduler.stats());
    scheduler.stop();
    handle
        .await
        .map_err(|e| anyhow::anyhow!("scheduler loop failed: {e}"))?;

    tracing::info!("fae-tasks demo shut down cleanly");
    Ok(())
}
