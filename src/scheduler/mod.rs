//! Background task scheduler.
//!
//! Lets the assistant keep taking commands while long-running work
//! (downloads, timers, polling) runs concurrently in the background, with
//! bounded parallelism, priority ordering, cooperative cancellation and
//! progress/state visibility.
//!
//! ```text
//! submit() -> Pending -> (tick) Running -> Completed | Failed | Cancelled
//!                                   \-> listeners: started, then one terminal event
//! ```

mod executor;
mod registry;

pub mod events;
pub mod runner;
pub mod task;
pub mod work;

pub use events::{Listener, ListenerId, TaskEventKind};
pub use runner::TaskScheduler;
pub use task::{TaskId, TaskSnapshot, TaskState, TaskStats};
pub use work::{TaskContext, WorkError, WorkFunction, WorkResult};

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_owned()
    }
}
