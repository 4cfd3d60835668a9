//! Task identifiers, lifecycle states and the snapshots handed to callers.

use crate::scheduler::work::WorkFunction;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Opaque unique task identifier, assigned at submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    pub(crate) fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// The underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

/// Lifecycle state of a task.
///
/// ```text
/// Pending -> Running -> Completed | Failed | Cancelled
/// Pending -> Cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Submitted, waiting for a free slot.
    Pending,
    /// Dispatched; the work function is executing.
    Running,
    /// Work function returned a result.
    Completed,
    /// Work function returned an error or panicked.
    Failed,
    /// Cancelled before starting, or cancellation was observed while running.
    Cancelled,
}

impl TaskState {
    /// All states, in lifecycle order.
    pub const ALL: [TaskState; 5] = [
        Self::Pending,
        Self::Running,
        Self::Completed,
        Self::Failed,
        Self::Cancelled,
    ];

    /// `true` for states no transition leaves.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Stable lowercase name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read-only copy of a task's public fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub id: TaskId,
    pub name: String,
    pub state: TaskState,
    pub priority: i32,
    /// Percent complete in `[0, 100]`.
    pub progress: f64,
    /// Success payload, present only once completed.
    pub result: Option<serde_json::Value>,
    /// Failure message, present only once failed.
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl TaskSnapshot {
    /// `true` once the task reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Wall-clock run time, once the task has both started and finished.
    pub fn run_duration(&self) -> Option<chrono::Duration> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }
}

/// Task counts per state.
///
/// The per-state counts always add up to `total`, the number of tasks ever
/// submitted, including tasks evicted by the retention policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStats {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl TaskStats {
    /// Count for a single state.
    pub fn count(&self, state: TaskState) -> usize {
        match state {
            TaskState::Pending => self.pending,
            TaskState::Running => self.running,
            TaskState::Completed => self.completed,
            TaskState::Failed => self.failed,
            TaskState::Cancelled => self.cancelled,
        }
    }

    pub(crate) fn bump(&mut self, state: TaskState) {
        match state {
            TaskState::Pending => self.pending += 1,
            TaskState::Running => self.running += 1,
            TaskState::Completed => self.completed += 1,
            TaskState::Failed => self.failed += 1,
            TaskState::Cancelled => self.cancelled += 1,
        }
    }
}

impl fmt::Display for TaskStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} tasks: {} running, {} pending, {} completed, {} failed, {} cancelled",
            self.total, self.running, self.pending, self.completed, self.failed, self.cancelled
        )
    }
}

/// Registry-owned task record. Never leaves the registry.
pub(crate) struct TaskRecord {
    pub id: TaskId,
    /// Submission sequence number, the FIFO tie-breaker.
    pub seq: u64,
    pub name: String,
    pub work: Arc<dyn WorkFunction>,
    pub state: TaskState,
    pub priority: i32,
    pub progress: f64,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancel: CancellationToken,
}

impl TaskRecord {
    pub fn new(seq: u64, name: String, work: Arc<dyn WorkFunction>, priority: i32) -> Self {
        Self {
            id: TaskId::generate(),
            seq,
            name,
            work,
            state: TaskState::Pending,
            priority,
            progress: 0.0,
            result: None,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            id: self.id,
            name: self.name.clone(),
            state: self.state,
            priority: self.priority,
            progress: self.progress,
            result: self.result.clone(),
            error: self.error.clone(),
            created_at: self.created_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
        }
    }

    /// Dispatch order: higher priority first, then earliest submission.
    pub fn dispatch_cmp(&self, other: &Self) -> Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| self.created_at.cmp(&other.created_at))
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

/// Clamp a progress percentage into `[0, 100]`. NaN yields `None`.
pub(crate) fn clamp_progress(percent: f64) -> Option<f64> {
    if percent.is_nan() {
        None
    } else {
        Some(percent.clamp(0.0, 100.0))
    }
}
