//! Task registry: exclusive owner of every task record.
//!
//! The task map, the submission counter, deferred events, eviction counters
//! and the listener list all live behind one mutex. No lock is held across an
//! `.await`; listeners are cloned out before they are invoked.

use crate::config::RetentionConfig;
use crate::scheduler::events::{Listener, ListenerId, TaskEventKind};
use crate::scheduler::task::{
    TaskId, TaskRecord, TaskSnapshot, TaskState, TaskStats, clamp_progress,
};
use crate::scheduler::work::WorkFunction;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Terminal outcome written by the executor.
#[derive(Debug)]
pub(crate) enum Outcome {
    Completed(serde_json::Value),
    Failed(String),
    Cancelled,
}

impl Outcome {
    pub fn event_kind(&self) -> TaskEventKind {
        match self {
            Self::Completed(_) => TaskEventKind::Completed,
            Self::Failed(_) => TaskEventKind::Failed,
            Self::Cancelled => TaskEventKind::Cancelled,
        }
    }
}

/// Everything an executor needs to run a freshly dispatched task.
pub(crate) struct DispatchTicket {
    pub id: TaskId,
    pub work: Arc<dyn WorkFunction>,
    pub cancel: CancellationToken,
    /// Snapshot taken right after the Pending -> Running transition.
    pub snapshot: TaskSnapshot,
}

#[derive(Default)]
struct RegistryState {
    tasks: HashMap<TaskId, TaskRecord>,
    next_seq: u64,
    /// Events raised outside the scheduler loop, delivered on its next tick.
    deferred: Vec<(TaskSnapshot, TaskEventKind)>,
    /// Terminal tasks removed by the retention policy, per state.
    evicted: TaskStats,
    listeners: Vec<(ListenerId, Listener)>,
    next_listener_id: u64,
}

pub(crate) struct TaskRegistry {
    state: Mutex<RegistryState>,
    /// Woken whenever a task reaches a terminal state.
    terminal: Notify,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RegistryState::default()),
            terminal: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn submit(&self, name: String, work: Arc<dyn WorkFunction>, priority: i32) -> TaskId {
        let mut state = self.lock();
        let seq = state.next_seq;
        state.next_seq += 1;
        let record = TaskRecord::new(seq, name, work, priority);
        let id = record.id;
        debug!(task_id = %id, name = %record.name, priority, "task submitted");
        state.tasks.insert(id, record);
        id
    }

    pub fn get(&self, id: TaskId) -> Option<TaskSnapshot> {
        self.lock().tasks.get(&id).map(TaskRecord::snapshot)
    }

    /// Snapshots, most recently submitted first.
    pub fn list(&self, filter: Option<TaskState>) -> Vec<TaskSnapshot> {
        let state = self.lock();
        let mut records: Vec<&TaskRecord> = state
            .tasks
            .values()
            .filter(|r| filter.is_none_or(|wanted| r.state == wanted))
            .collect();
        records.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.seq.cmp(&a.seq))
        });
        records.into_iter().map(TaskRecord::snapshot).collect()
    }

    /// Request cancellation. Pending tasks are cancelled on the spot; their
    /// event is deferred to the scheduler loop.
    pub fn cancel(&self, id: TaskId) -> bool {
        let cancelled = {
            let mut state = self.lock();
            let Some(record) = state.tasks.get_mut(&id) else {
                return false;
            };
            match record.state {
                TaskState::Pending => {
                    record.state = TaskState::Cancelled;
                    record.completed_at = Some(Utc::now());
                    record.cancel.cancel();
                    let snapshot = record.snapshot();
                    state.deferred.push((snapshot, TaskEventKind::Cancelled));
                    true
                }
                TaskState::Running => {
                    record.cancel.cancel();
                    false
                }
                TaskState::Completed | TaskState::Failed | TaskState::Cancelled => return false,
            }
        };
        if cancelled {
            debug!(task_id = %id, "pending task cancelled");
            self.terminal.notify_waiters();
        } else {
            debug!(task_id = %id, "cancellation requested for running task");
        }
        true
    }

    pub fn set_priority(&self, id: TaskId, priority: i32) -> bool {
        let mut state = self.lock();
        match state.tasks.get_mut(&id) {
            Some(record) if record.state == TaskState::Pending => {
                record.priority = priority;
                true
            }
            _ => false,
        }
    }

    /// Update progress of a running task.
    pub fn set_progress(&self, id: TaskId, percent: f64) -> bool {
        let Some(percent) = clamp_progress(percent) else {
            return false;
        };
        let mut state = self.lock();
        match state.tasks.get_mut(&id) {
            Some(record) if record.state == TaskState::Running => {
                record.progress = percent;
                true
            }
            _ => false,
        }
    }

    pub fn stats(&self) -> TaskStats {
        let state = self.lock();
        let mut stats = state.evicted;
        for record in state.tasks.values() {
            stats.bump(record.state);
        }
        stats.total = usize::try_from(state.next_seq).unwrap_or(usize::MAX);
        stats
    }

    /// Move up to `max_concurrent - running` pending tasks to Running, in
    /// dispatch order, and hand them back for execution.
    pub fn dispatch(&self, max_concurrent: usize) -> Vec<DispatchTicket> {
        let mut state = self.lock();
        let running = state
            .tasks
            .values()
            .filter(|r| r.state == TaskState::Running)
            .count();
        let available = max_concurrent.saturating_sub(running);
        if available == 0 {
            return Vec::new();
        }

        let mut pending: Vec<&TaskRecord> = state
            .tasks
            .values()
            .filter(|r| r.state == TaskState::Pending)
            .collect();
        if pending.is_empty() {
            return Vec::new();
        }
        pending.sort_by(|a, b| a.dispatch_cmp(b));
        let selected: Vec<TaskId> = pending.iter().take(available).map(|r| r.id).collect();

        let now = Utc::now();
        let mut tickets = Vec::with_capacity(selected.len());
        for id in selected {
            let Some(record) = state.tasks.get_mut(&id) else {
                continue;
            };
            record.state = TaskState::Running;
            record.started_at = Some(now);
            tickets.push(DispatchTicket {
                id,
                work: Arc::clone(&record.work),
                cancel: record.cancel.clone(),
                snapshot: record.snapshot(),
            });
        }
        tickets
    }

    /// Write a terminal outcome for a running task.
    ///
    /// Returns `None` when the task is unknown or no longer running; a
    /// terminal state is never overwritten.
    pub fn finish(&self, id: TaskId, outcome: Outcome) -> Option<TaskSnapshot> {
        let snapshot = {
            let mut state = self.lock();
            let record = state.tasks.get_mut(&id)?;
            if record.state != TaskState::Running {
                return None;
            }
            match outcome {
                Outcome::Completed(value) => {
                    record.state = TaskState::Completed;
                    record.progress = 100.0;
                    record.result = Some(value);
                }
                Outcome::Failed(message) => {
                    record.state = TaskState::Failed;
                    record.error = Some(message);
                }
                Outcome::Cancelled => record.state = TaskState::Cancelled,
            }
            record.completed_at = Some(Utc::now());
            record.snapshot()
        };
        self.terminal.notify_waiters();
        Some(snapshot)
    }

    /// Cancel the token of every running task. Returns how many were signalled.
    pub fn cancel_running(&self) -> usize {
        let state = self.lock();
        let mut signalled = 0;
        for record in state.tasks.values() {
            if record.state == TaskState::Running {
                record.cancel.cancel();
                signalled += 1;
            }
        }
        signalled
    }

    /// Force every still-running task to Cancelled. Used after the shutdown
    /// grace period, once their executors have been aborted.
    pub fn abandon_running(&self) -> Vec<TaskSnapshot> {
        let running: Vec<TaskId> = self
            .lock()
            .tasks
            .values()
            .filter(|r| r.state == TaskState::Running)
            .map(|r| r.id)
            .collect();
        running
            .into_iter()
            .filter_map(|id| self.finish(id, Outcome::Cancelled))
            .collect()
    }

    pub fn take_deferred(&self) -> Vec<(TaskSnapshot, TaskEventKind)> {
        std::mem::take(&mut self.lock().deferred)
    }

    /// Evict terminal tasks that finished more than `older_than` ago.
    pub fn reap_terminal(&self, older_than: Duration) -> usize {
        let Ok(age) = chrono::Duration::from_std(older_than) else {
            return 0;
        };
        let cutoff = Utc::now() - age;
        let mut state = self.lock();
        let expired: Vec<TaskId> = state
            .tasks
            .values()
            .filter(|r| r.state.is_terminal() && r.completed_at.is_some_and(|at| at <= cutoff))
            .map(|r| r.id)
            .collect();
        evict(&mut state, &expired)
    }

    /// Apply the configured TTL and history cap.
    pub fn enforce_retention(&self, retention: &RetentionConfig) -> usize {
        let mut evicted = retention
            .terminal_ttl()
            .map_or(0, |ttl| self.reap_terminal(ttl));

        let mut state = self.lock();
        let mut terminal: Vec<&TaskRecord> = state
            .tasks
            .values()
            .filter(|r| r.state.is_terminal())
            .collect();
        if terminal.len() > retention.max_terminal_tasks {
            terminal.sort_by(|a, b| {
                a.completed_at
                    .cmp(&b.completed_at)
                    .then_with(|| a.seq.cmp(&b.seq))
            });
            let drop_count = terminal.len() - retention.max_terminal_tasks;
            let oldest: Vec<TaskId> = terminal.iter().take(drop_count).map(|r| r.id).collect();
            evicted += evict(&mut state, &oldest);
        }
        evicted
    }

    pub fn add_listener(&self, listener: Listener) -> ListenerId {
        let mut state = self.lock();
        let id = ListenerId(state.next_listener_id);
        state.next_listener_id += 1;
        state.listeners.push((id, listener));
        id
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut state = self.lock();
        let before = state.listeners.len();
        state.listeners.retain(|(listener_id, _)| *listener_id != id);
        state.listeners.len() != before
    }

    pub fn listeners(&self) -> Vec<(ListenerId, Listener)> {
        self.lock().listeners.clone()
    }

    /// Resolve once the task is terminal. `None` if the id is unknown.
    pub async fn wait(&self, id: TaskId) -> Option<TaskSnapshot> {
        loop {
            let notified = self.terminal.notified();
            tokio::pin!(notified);
            // Register before checking so a transition in between is not missed.
            notified.as_mut().enable();

            let snapshot = self.get(id)?;
            if snapshot.is_terminal() {
                return Some(snapshot);
            }
            notified.await;
        }
    }
}

fn evict(state: &mut RegistryState, ids: &[TaskId]) -> usize {
    let mut removed = 0;
    for id in ids {
        if let Some(record) = state.tasks.remove(id) {
            state.evicted.bump(record.state);
            removed += 1;
        }
    }
    if removed > 0 {
        debug!(removed, "evicted finished tasks");
    }
    removed
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::scheduler::work::{TaskContext, WorkResult};

    async fn noop(_ctx: TaskContext) -> WorkResult {
        Ok(serde_json::Value::Null)
    }

    fn submit(registry: &TaskRegistry, name: &str, priority: i32) -> TaskId {
        registry.submit(name.to_owned(), Arc::new(noop), priority)
    }

    fn names(tickets: &[DispatchTicket]) -> Vec<String> {
        tickets.iter().map(|t| t.snapshot.name.clone()).collect()
    }

    #[test]
    fn submit_creates_pending_task() {
        let registry = TaskRegistry::new();
        let id = submit(&registry, "download", 5);
        let task = registry.get(id).unwrap();
        assert_eq!(task.name, "download");
        assert_eq!(task.state, TaskState::Pending);
        assert_eq!(task.priority, 5);
        assert!(registry.get(TaskId::generate()).is_none());
    }

    #[test]
    fn list_is_newest_first_and_filters() {
        let registry = TaskRegistry::new();
        let a = submit(&registry, "a", 0);
        let b = submit(&registry, "b", 0);
        let c = submit(&registry, "c", 0);
        assert!(registry.cancel(b));

        let all: Vec<TaskId> = registry.list(None).iter().map(|t| t.id).collect();
        assert_eq!(all, vec![c, b, a]);

        let pending: Vec<TaskId> = registry
            .list(Some(TaskState::Pending))
            .iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(pending, vec![c, a]);
        assert_eq!(registry.list(Some(TaskState::Cancelled)).len(), 1);
    }

    #[test]
    fn dispatch_respects_priority_fifo_and_slots() {
        let registry = TaskRegistry::new();
        submit(&registry, "low", 1);
        submit(&registry, "high", 100);
        submit(&registry, "medium", 50);
        submit(&registry, "high-2", 100);

        let first = registry.dispatch(2);
        assert_eq!(names(&first), vec!["high", "high-2"]);
        assert!(first.iter().all(|t| t.snapshot.state == TaskState::Running));
        assert!(first.iter().all(|t| t.snapshot.started_at.is_some()));

        // No free slot while both are running.
        assert!(registry.dispatch(2).is_empty());
        assert_eq!(registry.stats().running, 2);

        registry.finish(first[0].id, Outcome::Completed(serde_json::json!(1)));
        let next = registry.dispatch(2);
        assert_eq!(names(&next), vec!["medium"]);
    }

    #[test]
    fn cancel_rules() {
        let registry = TaskRegistry::new();
        let pending = submit(&registry, "pending", 0);
        let running = submit(&registry, "running", 10);
        let tickets = registry.dispatch(1);
        assert_eq!(tickets[0].id, running);

        assert!(!registry.cancel(TaskId::generate()));

        assert!(registry.cancel(running));
        assert!(tickets[0].cancel.is_cancelled());
        assert_eq!(registry.get(running).unwrap().state, TaskState::Running);

        assert!(registry.cancel(pending));
        let task = registry.get(pending).unwrap();
        assert_eq!(task.state, TaskState::Cancelled);
        assert!(task.completed_at.is_some());
        assert!(!registry.cancel(pending));

        let deferred = registry.take_deferred();
        assert_eq!(deferred.len(), 1);
        assert_eq!(deferred[0].0.id, pending);
        assert_eq!(deferred[0].1, TaskEventKind::Cancelled);
        assert!(registry.take_deferred().is_empty());

        // Cancelled pending tasks are never dispatched.
        assert!(registry.dispatch(5).is_empty());
    }

    #[test]
    fn terminal_state_is_never_overwritten() {
        let registry = TaskRegistry::new();
        let id = submit(&registry, "race", 0);
        registry.dispatch(1);

        let done = registry
            .finish(id, Outcome::Completed(serde_json::json!("ok")))
            .unwrap();
        assert_eq!(done.state, TaskState::Completed);
        assert_eq!(done.progress, 100.0);

        assert!(registry.finish(id, Outcome::Cancelled).is_none());
        assert!(registry.finish(id, Outcome::Failed("late".into())).is_none());
        assert!(!registry.cancel(id));
        let task = registry.get(id).unwrap();
        assert_eq!(task.state, TaskState::Completed);
        assert_eq!(task.result, Some(serde_json::json!("ok")));
        assert!(task.error.is_none());
    }

    #[test]
    fn set_priority_only_while_pending() {
        let registry = TaskRegistry::new();
        let a = submit(&registry, "a", 1);
        let b = submit(&registry, "b", 2);
        assert!(registry.set_priority(a, 10));
        assert_eq!(names(&registry.dispatch(1)), vec!["a"]);
        assert!(!registry.set_priority(a, 0));
        assert!(!registry.set_priority(TaskId::generate(), 0));
        assert!(registry.set_priority(b, 3));
    }

    #[test]
    fn set_progress_only_while_running() {
        let registry = TaskRegistry::new();
        let id = submit(&registry, "a", 0);
        assert!(!registry.set_progress(id, 10.0));
        registry.dispatch(1);
        assert!(registry.set_progress(id, 250.0));
        assert_eq!(registry.get(id).unwrap().progress, 100.0);
        assert!(!registry.set_progress(id, f64::NAN));
    }

    #[test]
    fn stats_sum_to_total_after_eviction() {
        let registry = TaskRegistry::new();
        for i in 0..6 {
            submit(&registry, &format!("t{i}"), 0);
        }
        let tickets = registry.dispatch(4);
        registry.finish(tickets[0].id, Outcome::Completed(serde_json::Value::Null));
        registry.finish(tickets[1].id, Outcome::Failed("boom".into()));
        registry.finish(tickets[2].id, Outcome::Cancelled);

        let check = |stats: TaskStats| {
            let sum: usize = TaskState::ALL.iter().map(|s| stats.count(*s)).sum();
            assert_eq!(sum, stats.total);
            assert_eq!(stats.total, 6);
        };

        let before = registry.stats();
        check(before);
        assert_eq!(before.running, 1);
        assert_eq!(before.pending, 2);

        let evicted = registry.enforce_retention(&RetentionConfig {
            max_terminal_tasks: 0,
            terminal_ttl_secs: 0,
        });
        assert_eq!(evicted, 3);
        assert_eq!(registry.list(None).len(), 3);

        let after = registry.stats();
        check(after);
        assert_eq!(after, before);
    }

    #[test]
    fn retention_cap_evicts_oldest_first() {
        let registry = TaskRegistry::new();
        let ids: Vec<TaskId> = (0..3).map(|i| submit(&registry, &format!("t{i}"), 0)).collect();
        for id in &ids {
            registry.dispatch(1);
            registry.finish(*id, Outcome::Completed(serde_json::Value::Null));
        }

        let evicted = registry.enforce_retention(&RetentionConfig {
            max_terminal_tasks: 2,
            terminal_ttl_secs: 0,
        });
        assert_eq!(evicted, 1);
        assert!(registry.get(ids[0]).is_none());
        assert!(registry.get(ids[1]).is_some());
        assert!(registry.get(ids[2]).is_some());
    }

    #[test]
    fn reap_terminal_respects_age() {
        let registry = TaskRegistry::new();
        let done = submit(&registry, "done", 0);
        let waiting = submit(&registry, "waiting", 0);
        registry.dispatch(1);
        registry.finish(done, Outcome::Completed(serde_json::Value::Null));

        assert_eq!(registry.reap_terminal(Duration::from_secs(3600)), 0);
        assert_eq!(registry.reap_terminal(Duration::ZERO), 1);
        assert!(registry.get(done).is_none());
        assert!(registry.get(waiting).is_some());
        assert_eq!(registry.stats().completed, 1);
    }

    #[test]
    fn abandon_running_forces_cancelled() {
        let registry = TaskRegistry::new();
        let id = submit(&registry, "stuck", 0);
        registry.dispatch(1);
        assert_eq!(registry.cancel_running(), 1);

        let abandoned = registry.abandon_running();
        assert_eq!(abandoned.len(), 1);
        assert_eq!(abandoned[0].id, id);
        assert_eq!(abandoned[0].state, TaskState::Cancelled);
        assert!(registry.abandon_running().is_empty());
    }

    #[tokio::test]
    async fn wait_resolves_on_terminal_transition() {
        let registry = Arc::new(TaskRegistry::new());
        let id = submit(&registry, "a", 0);
        registry.dispatch(1);

        let waiter = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.wait(id).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        registry.finish(id, Outcome::Failed("boom".into()));

        let snapshot = tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .expect("wait should resolve")
            .unwrap()
            .unwrap();
        assert_eq!(snapshot.state, TaskState::Failed);
        assert_eq!(snapshot.error.as_deref(), Some("boom"));

        assert!(registry.wait(TaskId::generate()).await.is_none());
    }
}
