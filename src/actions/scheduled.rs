//! Run another action at a wall-clock time.

use crate::scheduler::{TaskContext, WorkFunction, WorkResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use std::sync::Arc;
use tracing::debug;

/// Waits until `run_at`, then runs `inner` with the same context.
///
/// Progress reads 50 once the wait is over and 100 when `inner` finishes.
/// A `run_at` in the past runs immediately.
#[derive(Clone)]
pub struct ScheduledAction {
    run_at: DateTime<Utc>,
    inner: Arc<dyn WorkFunction>,
}

impl std::fmt::Debug for ScheduledAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScheduledAction")
            .field("run_at", &self.run_at)
            .finish_non_exhaustive()
    }
}

impl ScheduledAction {
    pub fn new(run_at: DateTime<Utc>, inner: impl WorkFunction) -> Self {
        Self {
            run_at,
            inner: Arc::new(inner),
        }
    }
}

#[async_trait]
impl WorkFunction for ScheduledAction {
    async fn execute(&self, ctx: TaskContext) -> WorkResult {
        if let Ok(wait) = (self.run_at - Utc::now()).to_std() {
            debug!(task_id = %ctx.id(), run_at = %self.run_at, "waiting for scheduled time");
            ctx.sleep(wait).await?;
        }
        ctx.check_cancelled()?;
        ctx.set_progress(50.0);

        let action_result = self.inner.execute(ctx.clone()).await?;
        ctx.set_progress(100.0);
        Ok(json!({
            "scheduled_for": self.run_at,
            "executed_at": Utc::now(),
            "action_result": action_result,
        }))
    }
}
