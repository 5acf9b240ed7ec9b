//! The work-stealing scheduler and its worker arena.
//!
//! Tasks are lightweight queued closures; workers are pooled OS threads
//! created once at scheduler construction and reused for every task. The
//! scheduler keeps a global injector queue plus one local deque per worker,
//! balanced by steal-half work stealing.

pub mod scheduler;

use std::sync::atomic::{AtomicU64, Ordering};

pub use scheduler::{spawn, Scheduler};

/// Snapshot of scheduler utilization.
#[derive(Debug, Clone, Default)]
pub struct SchedulerStats {
    /// Number of worker threads.
    pub worker_count: usize,
    /// Tasks currently queued on the global injector.
    pub queued_global: usize,
    /// Tasks currently executing on workers.
    pub running_tasks: u64,
    /// Total tasks submitted.
    pub submitted_tasks: u64,
    /// Total tasks run to completion (including ones that failed).
    pub completed_tasks: u64,
}

/// Lock-free counters behind [`SchedulerStats`].
#[derive(Debug, Default)]
pub(crate) struct SchedCounters {
    pub(crate) submitted: AtomicU64,
    pub(crate) completed: AtomicU64,
    pub(crate) running: AtomicU64,
}

impl SchedCounters {
    pub(crate) fn snapshot(&self, worker_count: usize, queued_global: usize) -> SchedulerStats {
        SchedulerStats {
            worker_count,
            queued_global,
            running_tasks: self.running.load(Ordering::Relaxed),
            submitted_tasks: self.submitted.load(Ordering::Relaxed),
            completed_tasks: self.completed.load(Ordering::Relaxed),
        }
    }
}
