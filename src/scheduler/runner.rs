//! Scheduler background loop.
//!
//! [`TaskScheduler`] is the host-facing handle: submission, inspection,
//! control and events. [`TaskScheduler::run`] spawns a tokio task that ticks
//! at a fixed interval, promotes pending tasks into free slots by priority,
//! and spawns one executor per dispatched task.

use crate::config::TaskSchedulerConfig;
use crate::error::{Result, SchedulerError};
use crate::scheduler::events::{EventNotifier, Listener, ListenerId, TaskEventKind};
use crate::scheduler::executor::TaskExecutor;
use crate::scheduler::registry::TaskRegistry;
use crate::scheduler::task::{TaskId, TaskSnapshot, TaskState, TaskStats};
use crate::scheduler::work::WorkFunction;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

struct Shared {
    config: TaskSchedulerConfig,
    registry: Arc<TaskRegistry>,
    notifier: EventNotifier,
    shutdown: CancellationToken,
    started: AtomicBool,
}

/// Background task scheduler.
///
/// Cheap to clone; all clones drive the same registry and loop.
#[derive(Clone)]
pub struct TaskScheduler {
    shared: Arc<Shared>,
}

impl Default for TaskScheduler {
    fn default() -> Self {
        Self::new(TaskSchedulerConfig::default())
    }
}

impl TaskScheduler {
    /// Create a scheduler. Nothing runs until [`run`](Self::run) is called.
    pub fn new(mut config: TaskSchedulerConfig) -> Self {
        config.max_concurrent = config.max_concurrent.max(1);
        config.tick_interval_ms = config.tick_interval_ms.max(1);

        let registry = Arc::new(TaskRegistry::new());
        let notifier = EventNotifier::new(Arc::clone(&registry));
        Self {
            shared: Arc::new(Shared {
                config,
                registry,
                notifier,
                shutdown: CancellationToken::new(),
                started: AtomicBool::new(false),
            }),
        }
    }

    /// Effective configuration.
    pub fn config(&self) -> &TaskSchedulerConfig {
        &self.shared.config
    }

    /// Submit a task. It starts in [`TaskState::Pending`].
    pub fn submit<W>(&self, name: impl Into<String>, work: W, priority: i32) -> TaskId
    where
        W: WorkFunction,
    {
        self.shared
            .registry
            .submit(name.into(), Arc::new(work), priority)
    }

    /// Snapshot of one task, or `None` if the id is unknown.
    pub fn get(&self, id: TaskId) -> Option<TaskSnapshot> {
        self.shared.registry.get(id)
    }

    /// Snapshots of all tasks (optionally in one state), newest first.
    pub fn list(&self, state: Option<TaskState>) -> Vec<TaskSnapshot> {
        self.shared.registry.list(state)
    }

    /// Request cancellation.
    ///
    /// Returns `false` for unknown or already finished tasks. A pending task
    /// is cancelled immediately and its `cancelled` event goes out on the next
    /// tick (or right away once the scheduler has been stopped); a running
    /// task becomes cancelled once its work function observes the request.
    pub fn cancel(&self, id: TaskId) -> bool {
        let accepted = self.shared.registry.cancel(id);
        // Once stopped, no tick will deliver the queued `cancelled` event.
        if accepted && self.shared.shutdown.is_cancelled() {
            self.spawn_flush();
        }
        accepted
    }

    /// Change the priority of a pending task. Returns `false` otherwise.
    pub fn set_priority(&self, id: TaskId, priority: i32) -> bool {
        self.shared.registry.set_priority(id, priority)
    }

    /// Update the progress of a running task from outside its work function.
    pub fn set_progress(&self, id: TaskId, percent: f64) -> bool {
        self.shared.registry.set_progress(id, percent)
    }

    /// Counts per state. They always add up to the number of tasks submitted.
    pub fn stats(&self) -> TaskStats {
        self.shared.registry.stats()
    }

    /// Wait until a task reaches a terminal state.
    ///
    /// Returns `None` for unknown ids (including tasks already evicted).
    pub async fn wait(&self, id: TaskId) -> Option<TaskSnapshot> {
        self.shared.registry.wait(id).await
    }

    /// Evict finished tasks older than `older_than`. Returns how many were removed.
    pub fn reap_terminal(&self, older_than: Duration) -> usize {
        self.shared.registry.reap_terminal(older_than)
    }

    /// Register an event listener.
    pub fn add_listener(&self, listener: Listener) -> ListenerId {
        self.shared.registry.add_listener(listener)
    }

    /// Remove a listener. Returns `false` if it was not registered.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.shared.registry.remove_listener(id)
    }

    /// `true` between [`run`](Self::run) and [`stop`](Self::stop).
    pub fn is_running(&self) -> bool {
        self.shared.started.load(Ordering::SeqCst) && !self.shared.shutdown.is_cancelled()
    }

    /// Start the scheduler background loop.
    ///
    /// The returned handle completes after [`stop`](Self::stop) once running
    /// tasks have finished or the shutdown grace period has elapsed.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Lifecycle`] if the loop was already started.
    pub fn run(&self) -> Result<JoinHandle<()>> {
        if self.shared.started.swap(true, Ordering::SeqCst) {
            return Err(SchedulerError::Lifecycle(
                "task scheduler was already started".to_owned(),
            ));
        }
        let scheduler = self.clone();
        Ok(tokio::spawn(async move { scheduler.run_loop().await }))
    }

    /// Stop the loop and request cancellation of every running task.
    ///
    /// Returns immediately; await the handle from [`run`](Self::run) for
    /// shutdown to complete. Pending tasks stay pending.
    pub fn stop(&self) {
        if self.shared.shutdown.is_cancelled() {
            return;
        }
        let signalled = self.shared.registry.cancel_running();
        info!(running = signalled, "task scheduler stop requested");
        self.shared.shutdown.cancel();
    }

    async fn run_loop(self) {
        let config = &self.shared.config;
        info!(
            max_concurrent = config.max_concurrent,
            tick_ms = config.tick_interval_ms,
            "task scheduler started"
        );

        let mut interval = tokio::time::interval(config.tick_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut executors = JoinSet::new();

        loop {
            tokio::select! {
                biased;
                _ = self.shared.shutdown.cancelled() => break,
                _ = interval.tick() => self.tick(&mut executors).await,
            }
        }

        self.shutdown(executors).await;
        info!("task scheduler stopped");
    }

    /// One scheduler tick: deliver deferred events, reap finished executors,
    /// dispatch into free slots, apply retention.
    async fn tick(&self, executors: &mut JoinSet<()>) {
        let shared = &self.shared;

        self.flush_deferred().await;
        reap_finished(executors);

        for ticket in shared.registry.dispatch(shared.config.max_concurrent) {
            debug!(task_id = %ticket.id, name = %ticket.snapshot.name, "dispatching task");
            let executor = TaskExecutor::new(
                Arc::clone(&shared.registry),
                shared.notifier.clone(),
                ticket,
            );
            executors.spawn(executor.run());
        }

        shared.registry.enforce_retention(&shared.config.retention);
    }

    fn spawn_flush(&self) {
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let scheduler = self.clone();
                runtime.spawn(async move { scheduler.flush_deferred().await });
            }
            Err(_) => debug!("no tokio runtime; cancelled event stays queued"),
        }
    }

    async fn flush_deferred(&self) {
        for (snapshot, kind) in self.shared.registry.take_deferred() {
            self.shared.notifier.notify(&snapshot, kind).await;
        }
    }

    async fn shutdown(&self, mut executors: JoinSet<()>) {
        let shared = &self.shared;
        shared.registry.cancel_running();

        let grace = shared.config.shutdown_grace();
        let drained = tokio::time::timeout(grace, async {
            while let Some(joined) = executors.join_next().await {
                log_join_error(joined);
            }
        })
        .await;

        if drained.is_err() {
            warn!(
                remaining = executors.len(),
                grace_ms = shared.config.shutdown_grace_ms,
                "shutdown grace period elapsed; abandoning running tasks"
            );
            executors.abort_all();
            while executors.join_next().await.is_some() {}
            for snapshot in shared.registry.abandon_running() {
                shared
                    .notifier
                    .notify(&snapshot, TaskEventKind::Cancelled)
                    .await;
            }
        }

        self.flush_deferred().await;
    }
}

fn reap_finished(executors: &mut JoinSet<()>) {
    while let Some(joined) = executors.try_join_next() {
        log_join_error(joined);
    }
}

fn log_join_error(joined: std::result::Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        if e.is_panic() {
            error!("task executor panicked: {e}");
        } else {
            debug!("task executor aborted: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::config::RetentionConfig;
    use crate::scheduler::work::{TaskContext, WorkError, WorkResult};
    use serde_json::json;
    use std::sync::Mutex;

    type EventLog = Arc<Mutex<Vec<(TaskId, TaskEventKind)>>>;

    fn record_events(scheduler: &TaskScheduler) -> EventLog {
        let log: EventLog = Arc::default();
        let sink = Arc::clone(&log);
        scheduler.add_listener(Listener::sync(move |task, kind| {
            sink.lock().unwrap().push((task.id, kind));
            Ok(())
        }));
        log
    }

    fn events_for(log: &EventLog, id: TaskId) -> Vec<TaskEventKind> {
        log.lock()
            .unwrap()
            .iter()
            .filter(|(task, _)| *task == id)
            .map(|(_, kind)| *kind)
            .collect()
    }

    fn fast_config(max_concurrent: usize) -> TaskSchedulerConfig {
        TaskSchedulerConfig {
            max_concurrent,
            tick_interval_ms: 10,
            shutdown_grace_ms: 200,
            ..TaskSchedulerConfig::default()
        }
    }

    async fn quick(ctx: TaskContext) -> WorkResult {
        ctx.sleep(Duration::from_millis(20)).await?;
        Ok(json!("done"))
    }

    async fn until_cancelled(ctx: TaskContext) -> WorkResult {
        ctx.cancelled().await;
        Err(WorkError::Cancelled)
    }

    async fn stubborn(_ctx: TaskContext) -> WorkResult {
        // Never checks for cancellation.
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(json!("too late"))
    }

    #[test]
    fn new_clamps_zero_concurrency() {
        let scheduler = TaskScheduler::new(TaskSchedulerConfig {
            max_concurrent: 0,
            ..TaskSchedulerConfig::default()
        });
        assert_eq!(scheduler.config().max_concurrent, 1);
        assert!(!scheduler.is_running());
    }

    #[tokio::test]
    async fn run_twice_is_an_error() {
        let scheduler = TaskScheduler::new(fast_config(1));
        let handle = scheduler.run().unwrap();
        assert!(scheduler.is_running());
        assert!(matches!(scheduler.run(), Err(SchedulerError::Lifecycle(_))));

        scheduler.stop();
        handle.await.unwrap();
        assert!(!scheduler.is_running());
    }

    #[tokio::test]
    async fn run_executes_submitted_tasks() {
        let scheduler = TaskScheduler::new(fast_config(2));
        let handle = scheduler.run().unwrap();

        let id = scheduler.submit("quick", quick, 0);
        let done = tokio::time::timeout(Duration::from_secs(5), scheduler.wait(id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(done.state, TaskState::Completed);
        assert_eq!(done.result, Some(json!("done")));

        scheduler.stop();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn stop_cancels_cooperative_tasks() {
        let scheduler = TaskScheduler::new(fast_config(1));
        let handle = scheduler.run().unwrap();

        let id = scheduler.submit(
            "long",
            |ctx: TaskContext| async move {
                ctx.sleep(Duration::from_secs(30)).await?;
                Ok::<_, WorkError>(json!("unreachable"))
            },
            0,
        );
        let waiting = scheduler.submit("queued", quick, 0);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(scheduler.get(id).unwrap().state, TaskState::Running);

        scheduler.stop();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(scheduler.get(id).unwrap().state, TaskState::Cancelled);
        assert_eq!(scheduler.get(waiting).unwrap().state, TaskState::Pending);
    }

    #[tokio::test]
    async fn stop_abandons_tasks_after_grace_period() {
        let scheduler = TaskScheduler::new(fast_config(1));
        let log = record_events(&scheduler);
        let handle = scheduler.run().unwrap();

        let id = scheduler.submit("stubborn", stubborn, 0);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(scheduler.get(id).unwrap().state, TaskState::Running);

        scheduler.stop();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("shutdown should finish after the grace period")
            .unwrap();

        let task = scheduler.get(id).unwrap();
        assert_eq!(task.state, TaskState::Cancelled);
        assert!(task.completed_at.is_some());
        assert_eq!(
            events_for(&log, id),
            vec![TaskEventKind::Started, TaskEventKind::Cancelled]
        );
    }

    #[tokio::test]
    async fn retention_is_applied_each_tick() {
        let scheduler = TaskScheduler::new(TaskSchedulerConfig {
            retention: crate::config::RetentionConfig {
                max_terminal_tasks: 1,
                terminal_ttl_secs: 0,
            },
            ..fast_config(3)
        });
        let handle = scheduler.run().unwrap();

        let ids: Vec<TaskId> = (0..3)
            .map(|i| scheduler.submit(format!("t{i}"), quick, 0))
            .collect();
        for id in &ids {
            let outcome = tokio::time::timeout(Duration::from_secs(5), scheduler.wait(*id))
                .await
                .expect("wait should resolve");
            // `None` when the cap evicted the task before the waiter looked.
            assert!(outcome.is_none_or(|task| task.state == TaskState::Completed));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(scheduler.list(None).len(), 1);
        let stats = scheduler.stats();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.completed, 3);

        scheduler.stop();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn terminal_ttl_is_applied_each_tick() {
        let scheduler = TaskScheduler::new(TaskSchedulerConfig {
            retention: RetentionConfig {
                max_terminal_tasks: 100,
                terminal_ttl_secs: 1,
            },
            ..fast_config(2)
        });
        let handle = scheduler.run().unwrap();

        let ids = [
            scheduler.submit("a", quick, 0),
            scheduler.submit("b", quick, 0),
        ];
        for id in ids {
            let done = tokio::time::timeout(Duration::from_secs(5), scheduler.wait(id))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(done.state, TaskState::Completed);
        }
        assert_eq!(scheduler.list(None).len(), 2);

        tokio::time::sleep(Duration::from_millis(1_300)).await;
        assert!(scheduler.list(None).is_empty());
        assert!(scheduler.get(ids[0]).is_none());
        assert!(scheduler.wait(ids[1]).await.is_none());
        let stats = scheduler.stats();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.completed, 2);

        scheduler.stop();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn pending_cancel_event_is_delivered_on_next_tick() {
        let scheduler = TaskScheduler::new(fast_config(1));
        let log = record_events(&scheduler);
        let handle = scheduler.run().unwrap();

        let blocker = scheduler.submit("blocker", until_cancelled, 10);
        let queued = scheduler.submit("queued", quick, 0);
        assert!(scheduler.cancel(queued));
        assert!(events_for(&log, queued).is_empty());

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(events_for(&log, queued), vec![TaskEventKind::Cancelled]);

        scheduler.cancel(blocker);
        scheduler.stop();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn cancel_after_stop_still_notifies() {
        let scheduler = TaskScheduler::new(fast_config(1));
        let log = record_events(&scheduler);
        let handle = scheduler.run().unwrap();
        scheduler.stop();
        handle.await.unwrap();

        let ids: Vec<TaskId> = (0..50)
            .map(|i| scheduler.submit(format!("late {i}"), quick, 0))
            .collect();
        for id in &ids {
            assert!(scheduler.cancel(*id));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        for id in &ids {
            assert_eq!(events_for(&log, *id), vec![TaskEventKind::Cancelled]);
        }
        assert!(scheduler.shared.registry.take_deferred().is_empty());
    }
}
