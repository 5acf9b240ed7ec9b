//! Structured-concurrency scopes.
//!
//! A scope owns every task spawned inside it and is joined before it is
//! released, on every exit path. Two error policies exist:
//!
//! - [`Scope`] is **fail-fast**: the first child failure cancels the scope's
//!   token (and so every sibling), and [`Scope::join_all`] reports that
//!   first error once all tasks have finished.
//! - [`SupervisorScope`] **isolates failures**: children fail independently,
//!   nothing is cancelled, and [`SupervisorScope::join_all`] returns every
//!   task's outcome.
//!
//! "First error" means the completion the scope observed first under its
//! lock. Two tasks failing near-simultaneously race for the slot; which one
//! wins is not related to spawn order.
//!
//! A scope moves `Open -> Closing -> Joined`; spawning after `Open` fails
//! with [`SpawnError::ScopeClosed`]. Scopes nest by linking their token as a
//! child of the spawning task's token, so cancellation flows downward only.
//!
//! Cancellation inside a scope is advisory: a running task stops at its next
//! checkpoint. A body that never checkpoints after cancellation delays
//! `join_all` indefinitely - that obligation is on task authors; the scope
//! only guarantees it will not return early.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace};

use crate::core::cancel::{current_token, with_current_token, CancelToken};
use crate::core::error::{JoinError, ScopeError, SpawnError};
use crate::core::task::{panic_message, RawTask, TaskCell, TaskHandle, TaskId};
use crate::driver::{global_timer, TimerDriver};
use crate::sched::Scheduler;

/// Scope lifecycle phase.
#[repr(u8)]
enum Phase {
    Open = 0,
    Closing = 1,
    Joined = 2,
}

/// The outcome of one task in a supervised scope.
#[derive(Debug, Clone)]
pub struct TaskOutcome {
    /// Which task this outcome belongs to.
    pub id: TaskId,
    /// `Ok` for a successful completion, the task's error otherwise.
    pub result: Result<(), JoinError>,
}

struct JoinState {
    /// Tasks spawned and not yet finished. Guarded by the mutex so the
    /// decrement-and-notify and the join wait cannot miss each other.
    active: usize,
    /// First failure observed (fail-fast policy only).
    first_error: Option<JoinError>,
    /// Every task's outcome, in completion order.
    outcomes: Vec<TaskOutcome>,
}

struct ScopeCore {
    phase: AtomicU8,
    token: CancelToken,
    join_state: Mutex<JoinState>,
    all_done: Condvar,
    fail_fast: bool,
    scheduler: Option<Arc<Scheduler>>,
}

impl ScopeCore {
    fn new(fail_fast: bool, scheduler: Option<Arc<Scheduler>>) -> Arc<Self> {
        // Nesting: the scope's token follows the spawning task's token, so
        // cancelling an outer scope reaches tasks of inner scopes.
        let token = current_token().map_or_else(CancelToken::new, |parent| parent.child());
        Arc::new(Self {
            phase: AtomicU8::new(Phase::Open as u8),
            token,
            join_state: Mutex::new(JoinState {
                active: 0,
                first_error: None,
                outcomes: Vec::new(),
            }),
            all_done: Condvar::new(),
            fail_fast,
            scheduler,
        })
    }

    fn scheduler(&self) -> &Scheduler {
        self.scheduler
            .as_deref()
            .unwrap_or_else(|| Scheduler::global())
    }

    /// Record a finished task: outcome list, fail-fast election, active
    /// count. Sibling cancellation happens outside the lock.
    fn finish_task(&self, id: TaskId, outcome: Result<(), JoinError>) {
        let mut cancel_siblings = false;
        {
            let mut state = self.join_state.lock();
            if let Err(err) = &outcome {
                if self.fail_fast
                    && !matches!(err, JoinError::Cancelled)
                    && state.first_error.is_none()
                {
                    state.first_error = Some(err.clone());
                    cancel_siblings = true;
                }
            }
            state.outcomes.push(TaskOutcome { id, result: outcome });
            state.active -= 1;
            if state.active == 0 {
                self.all_done.notify_all();
            }
        }
        if cancel_siblings {
            debug!(task_id = %id, "first child error, cancelling siblings");
            self.token.cancel();
        }
    }

    /// Stop accepting spawns and wait for every task to finish.
    fn join_wait(&self) {
        let _ = self.phase.compare_exchange(
            Phase::Open as u8,
            Phase::Closing as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        let mut state = self.join_state.lock();
        while state.active > 0 {
            self.all_done.wait(&mut state);
        }
        drop(state);
        self.phase.store(Phase::Joined as u8, Ordering::Release);
    }

    fn active_count(&self) -> usize {
        self.join_state.lock().active
    }
}

/// Build and queue the worker closure for one scoped task.
fn spawn_impl<F, T>(core: &Arc<ScopeCore>, f: F) -> Result<TaskHandle<T>, SpawnError>
where
    F: FnOnce(CancelToken) -> Result<T, JoinError> + Send + 'static,
    T: Send + 'static,
{
    // Phase check and active increment under one lock: a spawn racing
    // `join_wait`'s transition to Closing either lands before it (and is
    // waited for) or observes Closing and is refused.
    {
        let mut state = core.join_state.lock();
        if core.phase.load(Ordering::Acquire) != Phase::Open as u8 {
            return Err(SpawnError::ScopeClosed);
        }
        state.active += 1;
    }

    let cell = Arc::new(TaskCell::new());

    let task_core = Arc::clone(core);
    let task_cell = Arc::clone(&cell);
    let task: RawTask = Box::new(move || {
        task_cell.mark_running();
        let token = task_core.token.clone();

        let result: Result<T, JoinError> = if token.is_cancelled() {
            // Cancelled before it ever ran; skip the body entirely.
            Err(JoinError::Cancelled)
        } else {
            let body_token = token.clone();
            match panic::catch_unwind(AssertUnwindSafe(|| {
                with_current_token(&token, || f(body_token))
            })) {
                Ok(result) => result,
                Err(payload) => Err(JoinError::TaskPanicked(panic_message(&payload))),
            }
        };

        let outcome = result.as_ref().map(|_| ()).map_err(Clone::clone);
        task_core.finish_task(task_cell.id(), outcome);
        task_cell.complete(result);
    });

    trace!(task_id = %cell.id(), "scoped task spawned");
    if let Err(err) = core.scheduler().spawn_boxed(task) {
        let mut state = core.join_state.lock();
        state.active -= 1;
        if state.active == 0 {
            core.all_done.notify_all();
        }
        return Err(err);
    }
    Ok(TaskHandle::new(cell))
}

macro_rules! scope_spawn_api {
    () => {
        /// Spawn an infallible task.
        ///
        /// # Errors
        ///
        /// [`SpawnError::ScopeClosed`] once the scope is closing or joined;
        /// [`SpawnError::Shutdown`] if the scheduler is gone.
        pub fn spawn<F, T>(&self, f: F) -> Result<TaskHandle<T>, SpawnError>
        where
            F: FnOnce() -> T + Send + 'static,
            T: Send + 'static,
        {
            spawn_impl(&self.core, move |_token: CancelToken| Ok(f()))
        }

        /// Spawn a task whose body may fail. `Err` outcomes feed the scope's
        /// error policy.
        ///
        /// # Errors
        ///
        /// As for [`spawn`](Self::spawn).
        pub fn spawn_fallible<F, T>(&self, f: F) -> Result<TaskHandle<T>, SpawnError>
        where
            F: FnOnce() -> Result<T, JoinError> + Send + 'static,
            T: Send + 'static,
        {
            spawn_impl(&self.core, move |_token: CancelToken| f())
        }

        /// Spawn a task that receives the scope's cancel token, for bodies
        /// that poll cancellation between work items.
        ///
        /// # Errors
        ///
        /// As for [`spawn`](Self::spawn).
        pub fn spawn_with_token<F, T>(&self, f: F) -> Result<TaskHandle<T>, SpawnError>
        where
            F: FnOnce(CancelToken) -> Result<T, JoinError> + Send + 'static,
            T: Send + 'static,
        {
            spawn_impl(&self.core, f)
        }

        /// A clone of the scope's cancel token.
        #[must_use]
        pub fn cancel_token(&self) -> CancelToken {
            self.core.token.clone()
        }

        /// Cancel every task in this scope (advisory; tasks stop at their
        /// next checkpoint).
        pub fn cancel(&self) {
            self.core.token.cancel();
        }

        /// Number of tasks spawned and not yet finished.
        #[must_use]
        pub fn active_count(&self) -> usize {
            self.core.active_count()
        }
    };
}

/// A fail-fast structured-concurrency scope.
///
/// # Example
///
/// ```rust,ignore
/// let scope = Scope::new();
/// let h1 = scope.spawn(|| 10)?;
/// let h2 = scope.spawn(|| 20)?;
/// scope.join_all()?;
/// assert_eq!(h1.join()? + h2.join()?, 30);
/// ```
pub struct Scope {
    core: Arc<ScopeCore>,
}

impl Scope {
    /// Create a scope on the global scheduler.
    #[must_use]
    pub fn new() -> Self {
        Self {
            core: ScopeCore::new(true, None),
        }
    }

    /// Create a scope spawning onto a specific scheduler.
    #[must_use]
    pub fn with_scheduler(scheduler: Arc<Scheduler>) -> Self {
        Self {
            core: ScopeCore::new(true, Some(scheduler)),
        }
    }

    scope_spawn_api!();

    /// Close the scope and wait for every task to reach a terminal state.
    ///
    /// Repeated calls return the same result.
    ///
    /// # Errors
    ///
    /// [`ScopeError::FirstChildError`] carrying the first failure the scope
    /// observed, after all tasks have finished.
    pub fn join_all(&self) -> Result<(), ScopeError> {
        self.core.join_wait();
        let state = self.core.join_state.lock();
        state
            .first_error
            .clone()
            .map_or(Ok(()), |err| Err(ScopeError::FirstChildError(err)))
    }
}

impl Default for Scope {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Scope {
    fn drop(&mut self) {
        // Join-before-exit on every path. When the owning block is
        // unwinding, the tasks' results can no longer be observed; cancel
        // so the join converges at the next checkpoints.
        if std::thread::panicking() {
            self.core.token.cancel();
        }
        self.core.join_wait();
    }
}

impl std::fmt::Debug for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scope")
            .field("active", &self.core.active_count())
            .field("cancelled", &self.core.token.is_cancelled())
            .finish()
    }
}

/// A structured-concurrency scope that isolates failures.
///
/// Child errors are collected, never propagated to siblings, and returned
/// all together by [`join_all`](Self::join_all).
pub struct SupervisorScope {
    core: Arc<ScopeCore>,
}

impl SupervisorScope {
    /// Create a supervised scope on the global scheduler.
    #[must_use]
    pub fn new() -> Self {
        Self {
            core: ScopeCore::new(false, None),
        }
    }

    /// Create a supervised scope spawning onto a specific scheduler.
    #[must_use]
    pub fn with_scheduler(scheduler: Arc<Scheduler>) -> Self {
        Self {
            core: ScopeCore::new(false, Some(scheduler)),
        }
    }

    scope_spawn_api!();

    /// Close the scope, wait for every task, and take the per-task
    /// outcomes (completion order). A second call returns an empty list.
    pub fn join_all(&self) -> Vec<TaskOutcome> {
        self.core.join_wait();
        std::mem::take(&mut self.core.join_state.lock().outcomes)
    }
}

impl Default for SupervisorScope {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SupervisorScope {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.core.token.cancel();
        }
        self.core.join_wait();
    }
}

impl std::fmt::Debug for SupervisorScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SupervisorScope")
            .field("active", &self.core.active_count())
            .finish()
    }
}

/// Run `f` with a fail-fast scope, joining all tasks before returning.
///
/// Child failures still cancel siblings but are not surfaced here; observe
/// them through task handles, or use [`scoped_failfast`] to get the first
/// error.
pub fn scoped<F, R>(f: F) -> R
where
    F: FnOnce(&Scope) -> R,
{
    let scope = Scope::new();
    let out = f(&scope);
    let _ = scope.join_all();
    out
}

/// Run `f` with a fail-fast scope and propagate the first child error.
///
/// # Errors
///
/// [`ScopeError::FirstChildError`] if any task failed.
pub fn scoped_failfast<F, R>(f: F) -> Result<R, ScopeError>
where
    F: FnOnce(&Scope) -> R,
{
    let scope = Scope::new();
    let out = f(&scope);
    scope.join_all().map(|()| out)
}

/// Run `f` with a supervised scope; returns the closure's value and every
/// task's outcome.
pub fn supervised<F, R>(f: F) -> (R, Vec<TaskOutcome>)
where
    F: FnOnce(&SupervisorScope) -> R,
{
    let scope = SupervisorScope::new();
    let out = f(&scope);
    let outcomes = scope.join_all();
    (out, outcomes)
}

/// Run `f` with a fail-fast scope that is cancelled if `timeout` elapses
/// before its tasks complete.
///
/// The timed-out party is cancelled, not killed: tasks stop at their next
/// checkpoint and the scope still joins them all before returning.
///
/// # Errors
///
/// [`ScopeError::DeadlineExceeded`] if the deadline fired (this takes
/// precedence over child errors); otherwise as [`scoped_failfast`].
pub fn scoped_with_deadline<F, R>(timeout: Duration, f: F) -> Result<R, ScopeError>
where
    F: FnOnce(&Scope) -> R,
{
    let scope = Scope::new();
    let token = scope.cancel_token();
    let fired = Arc::new(AtomicBool::new(false));
    let fired_flag = Arc::clone(&fired);

    let timer = global_timer().register(
        Instant::now() + timeout,
        Box::new(move || {
            fired_flag.store(true, Ordering::Release);
            token.cancel();
        }),
    );

    let out = f(&scope);
    let joined = scope.join_all();
    // If cancel() loses, the timer fired while tasks were still being
    // joined; that counts as a timeout.
    let beat_the_timer = timer.cancel();

    if !beat_the_timer && fired.load(Ordering::Acquire) {
        return Err(ScopeError::DeadlineExceeded(timeout));
    }
    joined.map(|()| out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicI32;
    use std::thread;

    #[test]
    fn test_scope_basic_join() {
        let result = scoped(|scope| {
            let h1 = scope.spawn(|| 10).unwrap();
            let h2 = scope.spawn(|| 20).unwrap();
            h1.join().unwrap() + h2.join().unwrap()
        });
        assert_eq!(result, 30);
    }

    #[test]
    fn test_tasks_finish_before_scope_exits() {
        let completed = Arc::new(AtomicBool::new(false));
        let completed_clone = Arc::clone(&completed);

        scoped(|scope| {
            scope
                .spawn(move || {
                    thread::sleep(Duration::from_millis(50));
                    completed_clone.store(true, Ordering::SeqCst);
                })
                .unwrap();
        });

        assert!(completed.load(Ordering::SeqCst));
    }

    #[test]
    fn test_failfast_first_error_cancels_siblings() {
        let counter = Arc::new(AtomicI32::new(0));
        let counter_clone = Arc::clone(&counter);

        let result = scoped_failfast(|scope| {
            scope
                .spawn_fallible(|| -> Result<i32, JoinError> { Err("x".into()) })
                .unwrap();

            scope
                .spawn_with_token(move |cancel| {
                    for _ in 0..50 {
                        if cancel.is_cancelled() {
                            return Err(JoinError::Cancelled);
                        }
                        thread::sleep(Duration::from_millis(10));
                        counter_clone.fetch_add(1, Ordering::SeqCst);
                    }
                    Ok(())
                })
                .unwrap();
            42
        });

        match result {
            Err(ScopeError::FirstChildError(JoinError::Failed(msg))) => assert_eq!(msg, "x"),
            other => panic!("expected first child error, got {other:?}"),
        }
        assert!(counter.load(Ordering::SeqCst) < 50, "sibling was not cancelled");
    }

    #[test]
    fn test_cancelled_children_do_not_win_error_slot() {
        // A task cancelled by the first error must not replace or become
        // the reported error.
        let result = scoped_failfast(|scope| {
            scope
                .spawn_fallible(|| -> Result<(), JoinError> { Err("real".into()) })
                .unwrap();
            scope
                .spawn_with_token(|cancel| -> Result<(), JoinError> {
                    for _ in 0..100 {
                        cancel.check()?;
                        thread::sleep(Duration::from_millis(5));
                    }
                    Ok(())
                })
                .unwrap();
        });

        match result {
            Err(ScopeError::FirstChildError(JoinError::Failed(msg))) => assert_eq!(msg, "real"),
            other => panic!("expected Failed(real), got {other:?}"),
        }
    }

    #[test]
    fn test_panic_becomes_task_panicked() {
        let result = scoped_failfast(|scope| {
            scope.spawn(|| panic!("intentional failure")).unwrap();
        });

        match result {
            Err(ScopeError::FirstChildError(JoinError::TaskPanicked(msg))) => {
                assert!(msg.contains("intentional failure"));
            }
            other => panic!("expected panic error, got {other:?}"),
        }
    }

    #[test]
    fn test_supervisor_does_not_cancel_siblings() {
        let counter = Arc::new(AtomicI32::new(0));
        let counter_clone = Arc::clone(&counter);

        let (_, outcomes) = supervised(|scope| {
            scope
                .spawn_fallible(|| -> Result<(), JoinError> { Err("isolated".into()) })
                .unwrap();
            scope
                .spawn(move || {
                    for _ in 0..5 {
                        thread::sleep(Duration::from_millis(10));
                        counter_clone.fetch_add(1, Ordering::SeqCst);
                    }
                })
                .unwrap();
        });

        assert_eq!(counter.load(Ordering::SeqCst), 5);
        assert_eq!(outcomes.len(), 2);
        assert_eq!(outcomes.iter().filter(|o| o.result.is_err()).count(), 1);
    }

    #[test]
    fn test_spawn_after_join_fails() {
        let scope = Scope::new();
        scope.spawn(|| ()).unwrap().join().unwrap();
        scope.join_all().unwrap();
        assert_eq!(
            scope.spawn(|| ()).map(|_| ()),
            Err(SpawnError::ScopeClosed)
        );
    }

    #[test]
    fn test_join_all_idempotent() {
        let scope = Scope::new();
        scope
            .spawn_fallible(|| -> Result<(), JoinError> { Err("once".into()) })
            .unwrap();
        let first = scope.join_all();
        let second = scope.join_all();
        assert_eq!(first, second);
    }

    #[test]
    fn test_nested_scopes() {
        let result = scoped(|outer| {
            let h = outer
                .spawn(|| {
                    scoped(|inner| {
                        let h = inner.spawn(|| 10).unwrap();
                        h.join().unwrap()
                    })
                })
                .unwrap();
            let h2 = outer.spawn(|| 20).unwrap();
            h.join().unwrap() + h2.join().unwrap()
        });
        assert_eq!(result, 30);
    }

    #[test]
    fn test_outer_cancellation_reaches_inner_scope() {
        let observed = Arc::new(AtomicBool::new(false));
        let observed_clone = Arc::clone(&observed);

        scoped(|outer| {
            let outer_token = outer.cancel_token();
            outer
                .spawn(move || {
                    // The inner scope's token is a child of this task's.
                    let inner = Scope::new();
                    let inner_token = inner.cancel_token();
                    inner
                        .spawn(move || {
                            for _ in 0..100 {
                                if inner_token.is_cancelled() {
                                    observed_clone.store(true, Ordering::SeqCst);
                                    return;
                                }
                                thread::sleep(Duration::from_millis(5));
                            }
                        })
                        .unwrap();
                    inner.join_all().unwrap();
                })
                .unwrap();

            thread::sleep(Duration::from_millis(20));
            outer_token.cancel();
        });

        assert!(observed.load(Ordering::SeqCst));
    }

    #[test]
    fn test_many_tasks() {
        let sum = scoped(|scope| {
            let handles: Vec<_> = (0..100)
                .map(|i| scope.spawn(move || i).unwrap())
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).sum::<i32>()
        });
        assert_eq!(sum, 4950);
    }

    #[test]
    fn test_deadline_scope_completes_in_time() {
        let result = scoped_with_deadline(Duration::from_secs(5), |scope| {
            let h = scope.spawn(|| 42).unwrap();
            h.join().unwrap()
        });
        assert_eq!(result.unwrap(), 42);
    }

    #[test]
    fn test_deadline_scope_times_out() {
        let result = scoped_with_deadline(Duration::from_millis(30), |scope| {
            scope
                .spawn_with_token(|cancel| -> Result<(), JoinError> {
                    for _ in 0..200 {
                        cancel.check()?;
                        thread::sleep(Duration::from_millis(5));
                    }
                    Ok(())
                })
                .unwrap();
            "body done"
        });

        assert!(matches!(result, Err(ScopeError::DeadlineExceeded(_))));
    }

    #[test]
    fn test_scope_with_dedicated_scheduler() {
        let scheduler = Arc::new(
            Scheduler::new(crate::config::SchedulerConfig::new().with_worker_count(2)).unwrap(),
        );
        let scope = Scope::with_scheduler(Arc::clone(&scheduler));
        let h = scope.spawn(|| 5).unwrap();
        assert_eq!(h.join().unwrap(), 5);
        scope.join_all().unwrap();
        drop(scope);
        scheduler.shutdown();
    }
}
