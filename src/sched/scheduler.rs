//! Work-stealing scheduler over a pooled worker arena.
//!
//! Queue layout: one global [`Injector`] for external submissions plus a
//! FIFO local deque per worker. A worker looks for its next task in this
//! order:
//!
//! 1. its own local deque - but roughly one time in
//!    `global_check_interval` (default 61) it checks the injector *first*,
//!    so externally-injected tasks cannot starve behind local work;
//! 2. the global injector, stealing a batch (up to half) into its deque;
//! 3. a random peer's deque, stealing half (`steal_batch_and_pop`) -
//!    stealing in halves keeps steal frequency low and balances load;
//! 4. parking on the scheduler's wake state until work is pushed.
//!
//! Spawns from inside a worker push to that worker's local deque (bounded by
//! `local_queue_capacity`, overflowing to the injector); spawns from outside
//! go straight to the injector.
//!
//! A task closure owns its panic handling and result publication; a task
//! that fails never aborts its worker. Tasks are not preempted: a body that
//! never returns and never reaches a cancellation checkpoint occupies its
//! worker forever. That is a documented obligation on task authors, not
//! something the scheduler enforces.

use std::cell::RefCell;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle};

use crossbeam_deque::{Injector, Steal, Stealer, Worker};
use parking_lot::{Condvar, Mutex};
use rand::rngs::ThreadRng;
use rand::Rng;
use tracing::{debug, info, trace};

use crate::config::SchedulerConfig;
use crate::core::error::{AppResult, JoinError, SpawnError};
use crate::core::task::{panic_message, RawTask, TaskCell, TaskHandle};

use super::{SchedCounters, SchedulerStats};

static SCHEDULER_IDS: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// The local deque of the worker running on this thread, tagged with its
    /// scheduler's id so spawns against a different scheduler fall through
    /// to that scheduler's injector.
    static LOCAL: RefCell<Option<(u64, Rc<Worker<RawTask>>)>> = const { RefCell::new(None) };
}

/// Condvar-protected wake state for idle workers.
struct WakeState {
    /// Set on every push; consumed by one woken worker before it rescans.
    work_hint: bool,
    /// Workers currently parked.
    sleepers: usize,
}

struct Inner {
    id: u64,
    config: SchedulerConfig,
    injector: Injector<RawTask>,
    stealers: Vec<Stealer<RawTask>>,
    idle: Mutex<WakeState>,
    work_available: Condvar,
    shutdown: AtomicBool,
    counters: SchedCounters,
}

impl Inner {
    /// Queue a task: the spawning worker's local deque when possible,
    /// otherwise the global injector. Always signals the wake state.
    fn schedule(&self, task: RawTask) {
        let mut task = Some(task);
        LOCAL.with(|slot| {
            if let Some((owner, local)) = slot.borrow().as_ref() {
                if *owner == self.id && local.len() < self.config.local_queue_capacity {
                    local.push(task.take().expect("task queued once"));
                }
            }
        });
        if let Some(task) = task {
            self.injector.push(task);
        }
        self.notify_one();
    }

    /// Set the work hint and wake one parked worker, if any. Taking the
    /// mutex orders the hint against a worker between its rescan and its
    /// wait, so the notification cannot be lost.
    fn notify_one(&self) {
        let mut idle = self.idle.lock();
        idle.work_hint = true;
        let parked = idle.sleepers > 0;
        drop(idle);
        if parked {
            self.work_available.notify_one();
        }
    }

    /// One pass of the §4.1-ordered search. `None` means everything looked
    /// empty on this pass.
    fn find_task(
        &self,
        local: &Worker<RawTask>,
        worker_id: usize,
        rng: &mut ThreadRng,
    ) -> Option<RawTask> {
        // Occasional injector-first check even when local work exists.
        if rng.random_ratio(1, self.config.global_check_interval) {
            if let Some(task) = self.steal_global(local) {
                return Some(task);
            }
        }

        if let Some(task) = local.pop() {
            return Some(task);
        }

        if let Some(task) = self.steal_global(local) {
            return Some(task);
        }

        self.steal_peers(local, worker_id, rng)
    }

    fn steal_global(&self, local: &Worker<RawTask>) -> Option<RawTask> {
        loop {
            match self.injector.steal_batch_and_pop(local) {
                Steal::Success(task) => return Some(task),
                Steal::Empty => return None,
                Steal::Retry => {}
            }
        }
    }

    /// Steal half of a randomly-chosen peer's deque, scanning every peer
    /// from a random starting point.
    fn steal_peers(
        &self,
        local: &Worker<RawTask>,
        worker_id: usize,
        rng: &mut ThreadRng,
    ) -> Option<RawTask> {
        let peers = self.stealers.len();
        if peers <= 1 {
            return None;
        }
        let start = rng.random_range(0..peers);
        for offset in 0..peers {
            let victim = (start + offset) % peers;
            if victim == worker_id {
                continue;
            }
            loop {
                match self.stealers[victim].steal_batch_and_pop(local) {
                    Steal::Success(task) => {
                        trace!(worker_id, victim, "stole work from peer");
                        return Some(task);
                    }
                    Steal::Empty => break,
                    Steal::Retry => {}
                }
            }
        }
        None
    }

    /// Find work or park until some is pushed. `None` only after shutdown
    /// with every reachable queue drained.
    fn next_task(
        &self,
        local: &Worker<RawTask>,
        worker_id: usize,
        rng: &mut ThreadRng,
    ) -> Option<RawTask> {
        loop {
            if let Some(task) = self.find_task(local, worker_id, rng) {
                return Some(task);
            }

            let mut idle = self.idle.lock();
            if self.shutdown.load(Ordering::Acquire) {
                return None;
            }
            if idle.work_hint {
                idle.work_hint = false;
                drop(idle);
                continue;
            }
            idle.sleepers += 1;
            self.work_available.wait(&mut idle);
            idle.sleepers -= 1;
            idle.work_hint = false;
        }
    }
}

/// A work-stealing scheduler over a fixed arena of worker threads.
///
/// Tasks submitted with [`spawn`](Self::spawn) run to completion on some
/// worker; there is no preemption. Most callers go through
/// [`Scope`](crate::core::Scope) rather than spawning free tasks directly.
///
/// A task blocked on a channel or a join occupies its worker for the
/// duration. Size `worker_count` for the expected number of concurrently
/// blocked tasks; with a single worker, a task that blocks on work queued
/// behind it deadlocks.
pub struct Scheduler {
    inner: Arc<Inner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    /// Create a scheduler and start its worker threads.
    ///
    /// # Errors
    ///
    /// Fails if the configuration does not validate.
    pub fn new(config: SchedulerConfig) -> AppResult<Self> {
        config
            .validate()
            .map_err(|e| anyhow::anyhow!("invalid scheduler config: {e}"))?;

        let locals: Vec<Worker<RawTask>> =
            (0..config.worker_count).map(|_| Worker::new_fifo()).collect();
        let stealers: Vec<Stealer<RawTask>> = locals.iter().map(Worker::stealer).collect();

        let worker_count = config.worker_count;
        let name_prefix = config.thread_name_prefix.clone();
        let stack_size = config.thread_stack_size;

        let inner = Arc::new(Inner {
            id: SCHEDULER_IDS.fetch_add(1, Ordering::Relaxed),
            config,
            injector: Injector::new(),
            stealers,
            idle: Mutex::new(WakeState {
                work_hint: false,
                sleepers: 0,
            }),
            work_available: Condvar::new(),
            shutdown: AtomicBool::new(false),
            counters: SchedCounters::default(),
        });

        let mut workers = Vec::with_capacity(worker_count);
        for (worker_id, local) in locals.into_iter().enumerate() {
            let mut builder = thread::Builder::new().name(format!("{name_prefix}-{worker_id}"));
            if let Some(size) = stack_size {
                builder = builder.stack_size(size);
            }
            let inner = Arc::clone(&inner);
            let handle = builder
                .spawn(move || worker_loop(&inner, local, worker_id))
                .expect("failed to spawn worker thread");
            workers.push(handle);
        }

        info!(worker_count, "scheduler started");
        Ok(Self {
            inner,
            workers: Mutex::new(workers),
        })
    }

    /// The process-wide scheduler with default configuration, started on
    /// first use.
    pub fn global() -> &'static Self {
        static GLOBAL: OnceLock<Scheduler> = OnceLock::new();
        GLOBAL.get_or_init(|| {
            Self::new(SchedulerConfig::default()).expect("default scheduler config is valid")
        })
    }

    /// Spawn a free task (owned by no scope) and return its handle.
    ///
    /// The closure's captured values move into the task. A panic inside the
    /// closure is caught at the task boundary and surfaces as
    /// [`JoinError::TaskPanicked`] on the handle.
    ///
    /// # Errors
    ///
    /// [`SpawnError::Shutdown`] if the scheduler is shutting down.
    pub fn spawn<F, T>(&self, f: F) -> Result<TaskHandle<T>, SpawnError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let cell = Arc::new(TaskCell::new());
        let task_cell = Arc::clone(&cell);
        let task: RawTask = Box::new(move || {
            task_cell.mark_running();
            let result = match panic::catch_unwind(AssertUnwindSafe(f)) {
                Ok(value) => Ok(value),
                Err(payload) => Err(JoinError::TaskPanicked(panic_message(&payload))),
            };
            task_cell.complete(result);
        });

        self.spawn_boxed(task)?;
        Ok(TaskHandle::new(cell))
    }

    /// Queue a prepared task closure.
    ///
    /// # Errors
    ///
    /// [`SpawnError::Shutdown`] if the scheduler is shutting down.
    pub(crate) fn spawn_boxed(&self, task: RawTask) -> Result<(), SpawnError> {
        if self.inner.shutdown.load(Ordering::Acquire) {
            return Err(SpawnError::Shutdown);
        }
        self.inner.counters.submitted.fetch_add(1, Ordering::Relaxed);
        self.inner.schedule(task);
        Ok(())
    }

    /// Number of worker threads.
    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.inner.config.worker_count
    }

    /// Whether shutdown has been requested.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.load(Ordering::Acquire)
    }

    /// Snapshot of current utilization.
    #[must_use]
    pub fn stats(&self) -> SchedulerStats {
        self.inner
            .counters
            .snapshot(self.inner.config.worker_count, self.inner.injector.len())
    }

    /// Shut down: refuse new spawns, let workers drain every reachable
    /// queue, then join them. Idempotent.
    pub fn shutdown(&self) {
        if self.inner.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("scheduler shutting down");
        // Take the idle lock so parked workers observe the flag on wake.
        drop(self.inner.idle.lock());
        self.inner.work_available.notify_all();

        let mut workers = self.workers.lock();
        for worker in workers.drain(..) {
            let _ = worker.join();
        }
        info!("scheduler shut down");
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        // Signal but do not join: a drop with tasks still running must not
        // hang. Explicit shutdown() is the graceful path.
        if !self.inner.shutdown.swap(true, Ordering::AcqRel) {
            debug!("scheduler dropped without explicit shutdown, detaching workers");
            drop(self.inner.idle.lock());
            self.inner.work_available.notify_all();
        }
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("workers", &self.inner.config.worker_count)
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

/// Spawn a free task on the [global scheduler](Scheduler::global).
///
/// # Errors
///
/// [`SpawnError::Shutdown`] if the global scheduler is shutting down.
pub fn spawn<F, T>(f: F) -> Result<TaskHandle<T>, SpawnError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    Scheduler::global().spawn(f)
}

/// Per-worker run loop: find or steal a task, run it, repeat. Runs until
/// shutdown is signalled and every reachable queue is drained.
fn worker_loop(inner: &Arc<Inner>, local: Worker<RawTask>, worker_id: usize) {
    let local = Rc::new(local);
    LOCAL.with(|slot| {
        *slot.borrow_mut() = Some((inner.id, Rc::clone(&local)));
    });
    debug!(worker_id, "worker started");

    let mut rng = rand::rng();
    while let Some(task) = inner.next_task(&local, worker_id, &mut rng) {
        // Work conservation: if more work is visible, get a peer moving
        // before we go heads-down on this task.
        if !inner.injector.is_empty() {
            inner.notify_one();
        }

        inner.counters.running.fetch_add(1, Ordering::Relaxed);
        task();
        inner.counters.running.fetch_sub(1, Ordering::Relaxed);
        inner.counters.completed.fetch_add(1, Ordering::Relaxed);
    }

    LOCAL.with(|slot| {
        *slot.borrow_mut() = None;
    });
    debug!(worker_id, "worker exiting");
}
