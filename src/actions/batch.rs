//! Sequential batch processing.

use crate::scheduler::{TaskContext, WorkFunction, WorkResult};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

type BatchOp<T> =
    Arc<dyn Fn(T) -> futures_util::future::BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;

/// Applies `op` to each item in turn, pausing `delay` before each one.
///
/// A failing item is recorded and the batch continues.
pub struct BatchAction<T> {
    items: Vec<T>,
    delay: Duration,
    op: BatchOp<T>,
}

impl<T> std::fmt::Debug for BatchAction<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchAction")
            .field("items", &self.items.len())
            .field("delay", &self.delay)
            .finish_non_exhaustive()
    }
}

impl<T> BatchAction<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new<F, Fut>(items: Vec<T>, op: F) -> Self
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        Self {
            items,
            delay: Duration::from_millis(100),
            op: Arc::new(move |item| Box::pin(op(item))),
        }
    }

    /// Pause before each item. Defaults to 100 ms.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[async_trait]
impl<T> WorkFunction for BatchAction<T>
where
    T: Clone + Send + Sync + 'static,
{
    async fn execute(&self, ctx: TaskContext) -> WorkResult {
        let total = self.items.len();
        let mut results = Vec::with_capacity(total);
        let mut successful = 0usize;

        for (index, item) in self.items.iter().enumerate() {
            ctx.check_cancelled()?;
            ctx.sleep(self.delay).await?;

            match (self.op)(item.clone()).await {
                Ok(value) => {
                    successful += 1;
                    results.push(json!({ "item": index, "success": true, "result": value }));
                }
                Err(e) => {
                    debug!(item = index, "batch item failed: {e:#}");
                    results.push(json!({ "item": index, "success": false, "error": format!("{e:#}") }));
                }
            }
            ctx.set_progress((index + 1) as f64 / total as f64 * 100.0);
        }

        ctx.set_progress(100.0);
        Ok(json!({
            "total": total,
            "successful": successful,
            "failed": total - successful,
            "results": results,
        }))
    }
}
