//! Per-task executor.
//!
//! Drives one dispatched task's work function to a terminal state and emits
//! the `started` event followed by exactly one terminal event.

use crate::scheduler::events::{EventNotifier, TaskEventKind};
use crate::scheduler::registry::{DispatchTicket, Outcome, TaskRegistry};
use crate::scheduler::work::{TaskContext, WorkError};
use futures_util::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

pub(crate) struct TaskExecutor {
    registry: Arc<TaskRegistry>,
    notifier: EventNotifier,
    ticket: DispatchTicket,
}

impl TaskExecutor {
    pub fn new(registry: Arc<TaskRegistry>, notifier: EventNotifier, ticket: DispatchTicket) -> Self {
        Self {
            registry,
            notifier,
            ticket,
        }
    }

    pub async fn run(self) {
        let DispatchTicket {
            id,
            work,
            cancel,
            snapshot,
        } = self.ticket;
        let name = snapshot.name.clone();

        info!(task_id = %id, name = %name, priority = snapshot.priority, "task started");
        self.notifier.notify(&snapshot, TaskEventKind::Started).await;

        let ctx = TaskContext::new(id, Arc::clone(&self.registry), cancel.clone());
        let outcome = match AssertUnwindSafe(work.execute(ctx)).catch_unwind().await {
            // A result that arrives after cancellation was requested does not
            // count as a completion.
            Ok(Ok(_)) if cancel.is_cancelled() => Outcome::Cancelled,
            Ok(Ok(value)) => Outcome::Completed(value),
            Ok(Err(WorkError::Cancelled)) => Outcome::Cancelled,
            Ok(Err(e)) => {
                warn!(task_id = %id, name = %name, "task failed: {e}");
                Outcome::Failed(e.to_string())
            }
            Err(panic) => {
                let message = super::panic_message(&*panic);
                error!(task_id = %id, name = %name, "work function panicked: {message}");
                Outcome::Failed(format!("work function panicked: {message}"))
            }
        };

        let kind = outcome.event_kind();
        match self.registry.finish(id, outcome) {
            Some(finished) => {
                info!(task_id = %id, name = %name, outcome = %kind, "task finished");
                self.notifier.notify(&finished, kind).await;
            }
            None => debug!(task_id = %id, "task already terminal; outcome {kind} discarded"),
        }
    }
}
