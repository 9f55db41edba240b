use std::time::Duration;

/// Failures reported by an automation engine or its frame source.
///
/// `Start` and `Task` display the engine's own message verbatim, because that
/// text is what the client receives in an `error` event.
#[derive(Clone, Debug, thiserror::Error)]
pub enum EngineError {
    #[error("{0}")]
    Start(String),
    #[error("{0}")]
    Task(String),
    #[error("screenshot capture failed: {0}")]
    Capture(String),
    #[error("engine is not running")]
    NotRunning,
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },
    #[error("engine transport error: {0}")]
    Transport(String),
}

impl EngineError {
    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Start(_) => "start",
            Self::Task(_) => "task",
            Self::Capture(_) => "capture",
            Self::NotRunning => "not_running",
            Self::Timeout { .. } => "timeout",
            Self::Transport(_) => "transport",
        }
    }
}
