//! Task lifecycle events and listener fan-out.
//!
//! Every state transition is delivered to each registered [`Listener`] as
//! `(snapshot, kind)`. A listener that errors or panics is logged and skipped;
//! it never stops delivery to the others or the scheduler loop.

use crate::scheduler::registry::TaskRegistry;
use crate::scheduler::task::TaskSnapshot;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::warn;

/// Kind of lifecycle transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskEventKind {
    /// Pending -> Running.
    Started,
    /// Running -> Completed.
    Completed,
    /// Running -> Failed.
    Failed,
    /// Pending/Running -> Cancelled.
    Cancelled,
}

impl TaskEventKind {
    /// Stable lowercase name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// `true` for the events that end a task's lifecycle.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Started)
    }
}

impl std::fmt::Display for TaskEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Synchronous listener callback.
pub type SyncListenerFn = dyn Fn(&TaskSnapshot, TaskEventKind) -> anyhow::Result<()> + Send + Sync;

/// Asynchronous listener callback.
pub type AsyncListenerFn =
    dyn Fn(TaskSnapshot, TaskEventKind) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync;

/// A registered event listener.
#[derive(Clone)]
pub enum Listener {
    /// Runs inline on the notifying task.
    Sync(Arc<SyncListenerFn>),
    /// Awaited on the notifying task.
    Async(Arc<AsyncListenerFn>),
}

impl Listener {
    /// Wrap a synchronous callback.
    pub fn sync<F>(f: F) -> Self
    where
        F: Fn(&TaskSnapshot, TaskEventKind) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self::Sync(Arc::new(f))
    }

    /// Wrap an asynchronous callback.
    pub fn asynchronous<F, Fut>(f: F) -> Self
    where
        F: Fn(TaskSnapshot, TaskEventKind) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self::Async(Arc::new(move |snapshot, kind| f(snapshot, kind).boxed()))
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sync(_) => f.write_str("Listener::Sync"),
            Self::Async(_) => f.write_str("Listener::Async"),
        }
    }
}

/// Handle returned by `add_listener`, used to remove the listener again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(pub(crate) u64);

/// Delivers events to the listeners registered on a [`TaskRegistry`].
#[derive(Clone)]
pub(crate) struct EventNotifier {
    registry: Arc<TaskRegistry>,
}

impl EventNotifier {
    pub fn new(registry: Arc<TaskRegistry>) -> Self {
        Self { registry }
    }

    /// Invoke every listener, in registration order.
    pub async fn notify(&self, snapshot: &TaskSnapshot, kind: TaskEventKind) {
        for (listener_id, listener) in self.registry.listeners() {
            if let Err(reason) = deliver(&listener, snapshot, kind).await {
                warn!(
                    listener = listener_id.0,
                    task_id = %snapshot.id,
                    event = %kind,
                    "task event listener failed: {reason}"
                );
            }
        }
    }
}

async fn deliver(
    listener: &Listener,
    snapshot: &TaskSnapshot,
    kind: TaskEventKind,
) -> Result<(), String> {
    match listener {
        Listener::Sync(f) => {
            match std::panic::catch_unwind(AssertUnwindSafe(|| f(snapshot, kind))) {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(e.to_string()),
                Err(panic) => Err(format!("panicked: {}", super::panic_message(&*panic))),
            }
        }
        Listener::Async(f) => {
            let fut = std::panic::catch_unwind(AssertUnwindSafe(|| f(snapshot.clone(), kind)))
                .map_err(|panic| format!("panicked: {}", super::panic_message(&*panic)))?;
            match AssertUnwindSafe(fut).catch_unwind().await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(e.to_string()),
                Err(panic) => Err(format!("panicked: {}", super::panic_message(&*panic))),
            }
        }
    }
}
