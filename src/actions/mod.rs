//! Reference background actions.
//!
//! Each action is a [`WorkFunction`](crate::scheduler::WorkFunction) that
//! reports progress and honours cancellation between units of work.

pub mod batch;
pub mod download;
pub mod health_check;
pub mod scheduled;
pub mod timer;

pub use batch::BatchAction;
pub use download::DownloadAction;
pub use health_check::{CheckRecord, HealthCheckAction};
pub use scheduled::ScheduledAction;
pub use timer::TimerAction;
