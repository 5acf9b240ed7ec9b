//! Task, scope, and cancellation primitives.

pub mod cancel;
pub mod error;
pub mod scope;
pub mod task;

pub use cancel::{current_token, CancelToken};
pub use error::{AppResult, ChannelError, JoinError, ScopeError, SpawnError};
pub use scope::{
    scoped, scoped_failfast, scoped_with_deadline, supervised, Scope, SupervisorScope,
    TaskOutcome,
};
pub use task::{TaskHandle, TaskId, TaskState};
