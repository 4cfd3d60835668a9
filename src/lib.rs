//! Fae background tasks: run long-lived work while the assistant stays
//! responsive.
//!
//! Work is submitted to a [`TaskScheduler`] with a priority. A periodic loop
//! starts pending tasks in priority-then-FIFO order, never running more than
//! `max_concurrent` at once. Running work reports progress and observes
//! cooperative cancellation through its [`TaskContext`]; listeners hear one
//! `started` event and exactly one terminal event per task.
//!
//! # Architecture
//!
//! - **Registry**: task records, counters and listeners behind one lock
//! - **Scheduler loop**: tick-driven dispatch, retention, graceful shutdown
//! - **Executor**: drives one work function to a terminal state
//! - **Notifier**: isolated delivery of lifecycle events
//! - **Actions**: timer, download, health check, batch and scheduled work

pub mod actions;
pub mod config;
pub mod error;
pub mod scheduler;

pub use config::{RetentionConfig, TaskSchedulerConfig};
pub use error::{Result, SchedulerError};
pub use scheduler::{
    Listener, ListenerId, TaskContext, TaskEventKind, TaskId, TaskScheduler, TaskSnapshot,
    TaskState, TaskStats, WorkError, WorkFunction, WorkResult,
};
