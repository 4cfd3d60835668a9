//! Error types for the task engine.
//!
//! Task-level failures never surface here: a failing work function ends in
//! [`TaskState::Failed`](crate::scheduler::TaskState::Failed) and its message
//! is kept on the task record. These variants cover the engine itself.

/// Top-level error type for the scheduler host surface.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    /// Configuration could not be parsed, serialized or validated.
    #[error("config error: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Scheduler lifecycle misuse (e.g. starting the loop twice).
    #[error("scheduler lifecycle error: {0}")]
    Lifecycle(String),
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, SchedulerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_category_prefix() {
        let err = SchedulerError::Config("max_concurrent must be >= 1".to_owned());
        assert_eq!(err.to_string(), "config error: max_concurrent must be >= 1");

        let err = SchedulerError::Lifecycle("already running".to_owned());
        assert!(err.to_string().starts_with("scheduler lifecycle error"));
    }

    #[test]
    fn io_errors_convert() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: SchedulerError = io.into();
        assert!(matches!(err, SchedulerError::Io(_)));
    }
}
