//! Task identity, state, and join handles.
//!
//! A task is the unit of scheduling: a boxed one-shot closure plus a shared
//! state cell. The closure is queued on the scheduler; the cell is what the
//! spawner keeps. Completion notification doubles as the task's waker - any
//! thread blocked in [`TaskHandle::join`] is woken through the cell's condvar
//! when the running worker publishes the result.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::core::error::JoinError;

/// The boxed closure a worker executes. All result capture, panic handling,
/// and scope bookkeeping is baked into the closure before it is queued.
pub(crate) type RawTask = Box<dyn FnOnce() + Send + 'static>;

/// Unique identifier for a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(u64);

impl TaskId {
    /// Generate a new process-unique task ID.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    #[must_use]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "task({})", self.0)
    }
}

/// Observable state of a task.
///
/// Transitions are monotonic: `Pending -> Running -> {Completed, Cancelled}`.
/// Once terminal, a task's state and result never change again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskState {
    /// Queued, not yet picked up by a worker.
    Pending = 0,
    /// Currently executing on a worker thread.
    Running = 1,
    /// Finished with a result (which may be an error).
    Completed = 2,
    /// Observed cancellation before producing a value.
    Cancelled = 3,
}

impl TaskState {
    const fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Pending,
            1 => Self::Running,
            2 => Self::Completed,
            _ => Self::Cancelled,
        }
    }

    const fn is_terminal(raw: u8) -> bool {
        raw >= Self::Completed as u8
    }
}

/// Shared completion cell between a queued task and its handle.
pub(crate) struct TaskCell<T> {
    id: TaskId,
    state: AtomicU8,
    result: Mutex<Option<Result<T, JoinError>>>,
    completed: Condvar,
}

impl<T> TaskCell<T> {
    pub(crate) fn new() -> Self {
        Self {
            id: TaskId::new(),
            state: AtomicU8::new(TaskState::Pending as u8),
            result: Mutex::new(None),
            completed: Condvar::new(),
        }
    }

    pub(crate) const fn id(&self) -> TaskId {
        self.id
    }

    pub(crate) fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Move `Pending -> Running`. A terminal state is never overwritten.
    pub(crate) fn mark_running(&self) {
        let _ = self.state.compare_exchange(
            TaskState::Pending as u8,
            TaskState::Running as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Publish the task's result and wake joiners. The terminal state is
    /// derived from the result; calling this twice is a logic error guarded
    /// by the forward-only state transition.
    pub(crate) fn complete(&self, result: Result<T, JoinError>) {
        let terminal = match &result {
            Err(JoinError::Cancelled) => TaskState::Cancelled,
            _ => TaskState::Completed,
        };

        let mut slot = self.result.lock();
        let prev = self.state.load(Ordering::Acquire);
        if TaskState::is_terminal(prev) {
            return;
        }
        *slot = Some(result);
        self.state.store(terminal as u8, Ordering::Release);
        self.completed.notify_all();
    }

    pub(crate) fn is_finished(&self) -> bool {
        TaskState::is_terminal(self.state.load(Ordering::Acquire))
    }

    fn wait_take(&self) -> Result<T, JoinError> {
        let mut slot = self.result.lock();
        while slot.is_none() {
            self.completed.wait(&mut slot);
        }
        slot.take().expect("result present after completion signal")
    }
}

/// Extract a readable message from a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<String>()
        .cloned()
        .or_else(|| payload.downcast_ref::<&str>().map(|s| (*s).to_string()))
        .unwrap_or_else(|| "unknown panic".to_string())
}

/// A handle to a spawned task producing a value of type `T`.
///
/// The handle is the sole owner of the task's result; [`join`](Self::join)
/// consumes the handle and returns it. Dropping the handle discards the
/// result but never detaches the task from its scope - the owning scope
/// still joins it.
pub struct TaskHandle<T> {
    cell: Arc<TaskCell<T>>,
}

impl<T> TaskHandle<T> {
    pub(crate) fn new(cell: Arc<TaskCell<T>>) -> Self {
        Self { cell }
    }

    /// Get the task ID.
    #[must_use]
    pub fn id(&self) -> TaskId {
        self.cell.id()
    }

    /// Current state of the task.
    #[must_use]
    pub fn state(&self) -> TaskState {
        self.cell.state()
    }

    /// Whether the task has reached a terminal state.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.cell.is_finished()
    }

    /// Block until the task completes and return its result.
    ///
    /// # Errors
    ///
    /// Returns the task's own failure: [`JoinError::Failed`] for an
    /// application error, [`JoinError::TaskPanicked`] for a caught panic, or
    /// [`JoinError::Cancelled`] if the task observed cancellation.
    pub fn join(self) -> Result<T, JoinError> {
        self.cell.wait_take()
    }
}

impl<T> std::fmt::Debug for TaskHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.cell.id())
            .field("state", &self.cell.state())
            .finish()
    }
}
