//! Error types for runtime operations.

use std::time::Duration;

use thiserror::Error;

/// Errors returned when a task cannot be spawned.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SpawnError {
    /// The scope has stopped accepting tasks (it is closing or joined).
    #[error("scope is closed to new tasks")]
    ScopeClosed,
    /// The scheduler has been shut down.
    #[error("scheduler has been shut down")]
    Shutdown,
}

/// The failure outcome of a task, observed through its handle or scope.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JoinError {
    /// The task body panicked; the payload message is captured at the task
    /// boundary and never unwinds into a worker thread.
    #[error("task panicked: {0}")]
    TaskPanicked(String),
    /// The task observed cancellation before producing a value.
    #[error("task was cancelled")]
    Cancelled,
    /// The task body returned an application error.
    #[error("task failed: {0}")]
    Failed(String),
}

impl From<String> for JoinError {
    fn from(msg: String) -> Self {
        Self::Failed(msg)
    }
}

impl From<&str> for JoinError {
    fn from(msg: &str) -> Self {
        Self::Failed(msg.to_string())
    }
}

impl From<anyhow::Error> for JoinError {
    fn from(err: anyhow::Error) -> Self {
        Self::Failed(format!("{err:#}"))
    }
}

/// Errors produced by channel operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ChannelError {
    /// The channel has been closed. Buffered values remain receivable until
    /// drained; only then do receivers observe this error.
    #[error("channel closed")]
    Closed,
    /// The channel is full (`try_send` only).
    #[error("channel full")]
    Full,
    /// The channel is empty (`try_recv` only).
    #[error("channel empty")]
    Empty,
    /// Every receiver handle has been dropped; sent values can never be
    /// delivered.
    #[error("channel disconnected")]
    Disconnected,
    /// The calling task's [`CancelToken`](super::CancelToken) was cancelled
    /// at a blocking-operation checkpoint.
    #[error("operation cancelled")]
    Cancelled,
}

/// Errors reported by a scope when it is joined.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScopeError {
    /// The first child failure observed by a fail-fast scope. "First" is the
    /// completion the scope saw first under its lock, not the task spawned
    /// first.
    #[error("child task failed: {0}")]
    FirstChildError(JoinError),
    /// The scope's deadline elapsed before its tasks completed.
    #[error("scope deadline of {0:?} exceeded")]
    DeadlineExceeded(Duration),
}

/// Application-facing result using anyhow for higher-level contexts.
pub type AppResult<T> = Result<T, anyhow::Error>;
