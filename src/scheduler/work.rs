//! Work-function contract.
//!
//! A background action implements [`WorkFunction`]. The executor hands it a
//! [`TaskContext`], which is the only view of the task a work function gets:
//! it can report progress and observe cancellation, nothing else.
//!
//! Cancellation is cooperative. The engine never drops a running work
//! function; the work function is expected to check [`TaskContext::is_cancelled`]
//! (or suspend through [`TaskContext::sleep`] / [`TaskContext::cancelled`])
//! between units of work and return [`WorkError::Cancelled`] promptly.
//!
//! Any `Fn(TaskContext) -> impl Future<Output = WorkResult>` is a work function:
//!
//! ```rust,ignore
//! async fn tidy_downloads(ctx: TaskContext) -> WorkResult {
//!     for step in 0..10 {
//!         ctx.sleep(Duration::from_millis(200)).await?;
//!         ctx.set_progress(f64::from(step + 1) * 10.0);
//!     }
//!     Ok(serde_json::json!({ "removed": 3 }))
//! }
//!
//! scheduler.submit("Tidy downloads", tidy_downloads, 0);
//! ```

use crate::scheduler::registry::TaskRegistry;
use crate::scheduler::task::{TaskId, clamp_progress};
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Outcome of a work function.
pub type WorkResult = Result<serde_json::Value, WorkError>;

/// Errors a work function can end with.
#[derive(Debug, thiserror::Error)]
pub enum WorkError {
    /// Cancellation was observed. Ends the task as cancelled, not failed.
    #[error("task cancelled")]
    Cancelled,

    /// Work failed with a descriptive message.
    #[error("{0}")]
    Failed(String),

    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// File system error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Any other error.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl WorkError {
    /// Shorthand for [`WorkError::Failed`].
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }

    /// `true` for [`WorkError::Cancelled`].
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// A unit of background work bound to a task at submission.
#[async_trait]
pub trait WorkFunction: Send + Sync + 'static {
    /// Run the work to completion, failure or observed cancellation.
    async fn execute(&self, ctx: TaskContext) -> WorkResult;
}

#[async_trait]
impl<F, Fut> WorkFunction for F
where
    F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = WorkResult> + Send + 'static,
{
    async fn execute(&self, ctx: TaskContext) -> WorkResult {
        (self)(ctx).await
    }
}

#[derive(Clone)]
enum ProgressSink {
    Registry(Arc<TaskRegistry>),
    /// Progress held locally, for running actions outside a scheduler.
    Local(Arc<AtomicU64>),
}

/// Restricted handle given to a running work function.
#[derive(Clone)]
pub struct TaskContext {
    id: TaskId,
    sink: ProgressSink,
    cancel: CancellationToken,
}

impl std::fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskContext")
            .field("id", &self.id)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

impl TaskContext {
    pub(crate) fn new(id: TaskId, registry: Arc<TaskRegistry>, cancel: CancellationToken) -> Self {
        Self {
            id,
            sink: ProgressSink::Registry(registry),
            cancel,
        }
    }

    /// A context not attached to any scheduler.
    ///
    /// Progress is kept on the context itself and read back with
    /// [`progress`](Self::progress). Useful for driving an action directly,
    /// e.g. in tests.
    pub fn standalone(cancel: CancellationToken) -> Self {
        Self {
            id: TaskId::generate(),
            sink: ProgressSink::Local(Arc::new(AtomicU64::new(0f64.to_bits()))),
            cancel,
        }
    }

    /// Id of the task this context belongs to.
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Report progress in percent. Clamped to `[0, 100]`; NaN is ignored.
    pub fn set_progress(&self, percent: f64) {
        let Some(percent) = clamp_progress(percent) else {
            return;
        };
        match &self.sink {
            ProgressSink::Registry(registry) => {
                registry.set_progress(self.id, percent);
            }
            ProgressSink::Local(cell) => cell.store(percent.to_bits(), Ordering::Relaxed),
        }
    }

    /// Last reported progress.
    pub fn progress(&self) -> f64 {
        match &self.sink {
            ProgressSink::Registry(registry) => registry
                .get(self.id)
                .map(|snapshot| snapshot.progress)
                .unwrap_or_default(),
            ProgressSink::Local(cell) => f64::from_bits(cell.load(Ordering::Relaxed)),
        }
    }

    /// `true` once cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// `Err(WorkError::Cancelled)` once cancellation has been requested.
    pub fn check_cancelled(&self) -> Result<(), WorkError> {
        if self.is_cancelled() {
            Err(WorkError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Resolves when cancellation is requested.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }

    /// Sleep for `duration`, waking early with `Err(WorkError::Cancelled)`
    /// if cancellation is requested meanwhile.
    pub async fn sleep(&self, duration: Duration) -> Result<(), WorkError> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(WorkError::Cancelled),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }

    /// Child token, cancelled together with this task.
    pub fn child_token(&self) -> CancellationToken {
        self.cancel.child_token()
    }
}
