//! Reminder timer.

use crate::scheduler::{TaskContext, WorkFunction, WorkResult};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use std::time::{Duration, Instant};

/// Waits for `duration`, reporting elapsed / total as progress, then returns
/// the reminder message.
#[derive(Debug, Clone)]
pub struct TimerAction {
    duration: Duration,
    message: String,
    tick: Duration,
}

impl TimerAction {
    /// Timer that updates progress once per second.
    pub fn new(duration: Duration, message: impl Into<String>) -> Self {
        Self {
            duration,
            message: message.into(),
            tick: Duration::from_secs(1),
        }
    }

    /// Override how often progress is updated.
    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick.max(Duration::from_millis(1));
        self
    }
}

#[async_trait]
impl WorkFunction for TimerAction {
    async fn execute(&self, ctx: TaskContext) -> WorkResult {
        let started = Instant::now();
        let total = self.duration.as_secs_f64();

        loop {
            ctx.check_cancelled()?;
            let elapsed = started.elapsed();
            if elapsed >= self.duration {
                break;
            }
            if total > 0.0 {
                ctx.set_progress(elapsed.as_secs_f64() / total * 100.0);
            }
            ctx.sleep(self.tick.min(self.duration - elapsed)).await?;
        }

        ctx.set_progress(100.0);
        Ok(json!({
            "message": self.message,
            "duration_secs": total,
            "triggered_at": Utc::now(),
        }))
    }
}
