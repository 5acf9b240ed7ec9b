//! Default thread-backed timer driver.
//!
//! A single `strand-timer` thread sleeps until the earliest registered
//! deadline, fires due callbacks, and re-arms. Registration and cancellation
//! are O(log n) against a deadline min-heap; cancelled entries are skipped
//! when they surface rather than removed eagerly.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace};

use super::{TimerDriver, TimerHandle, WakeFn};

struct TimerEntry {
    deadline: Instant,
    /// Registration order; breaks deadline ties so the heap order is total.
    seq: u64,
    wake: WakeFn,
    handle: TimerHandle,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Reversed: BinaryHeap is a max-heap, we want the nearest deadline
        // on top.
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct TimerShared {
    queue: Mutex<BinaryHeap<TimerEntry>>,
    /// New earlier deadline registered, or shutdown requested.
    rearm: Condvar,
    shutdown: AtomicBool,
    next_seq: AtomicU64,
}

/// Thread-backed [`TimerDriver`] over a deadline min-heap.
pub struct SystemTimer {
    shared: Arc<TimerShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl SystemTimer {
    /// Create a timer driver with its own dispatch thread.
    #[must_use]
    pub fn new() -> Self {
        let shared = Arc::new(TimerShared {
            queue: Mutex::new(BinaryHeap::new()),
            rearm: Condvar::new(),
            shutdown: AtomicBool::new(false),
            next_seq: AtomicU64::new(1),
        });

        let loop_shared = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name("strand-timer".to_string())
            .spawn(move || timer_loop(&loop_shared))
            .expect("failed to spawn timer thread");

        Self {
            shared,
            thread: Mutex::new(Some(thread)),
        }
    }
}

impl Default for SystemTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl TimerDriver for SystemTimer {
    fn register(&self, deadline: Instant, wake: WakeFn) -> TimerHandle {
        let handle = TimerHandle::new();
        let entry = TimerEntry {
            deadline,
            seq: self.shared.next_seq.fetch_add(1, Ordering::Relaxed),
            wake,
            handle: handle.clone(),
        };

        let mut queue = self.shared.queue.lock();
        queue.push(entry);
        drop(queue);
        // The new deadline may be earlier than what the thread is sleeping
        // toward.
        self.shared.rearm.notify_one();
        handle
    }
}

impl Drop for SystemTimer {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.rearm.notify_all();
        if let Some(thread) = self.thread.lock().take() {
            let _ = thread.join();
        }
    }
}

fn timer_loop(shared: &Arc<TimerShared>) {
    debug!("timer thread started");
    loop {
        let mut queue = shared.queue.lock();
        if shared.shutdown.load(Ordering::Acquire) {
            break;
        }

        let now = Instant::now();
        match queue.peek() {
            None => {
                shared.rearm.wait(&mut queue);
            }
            Some(entry) if entry.deadline > now => {
                let deadline = entry.deadline;
                let _ = shared.rearm.wait_until(&mut queue, deadline);
            }
            Some(_) => {
                let entry = queue.pop().expect("peeked entry present");
                // Fire outside the lock; callbacks may cancel tokens or
                // touch channels.
                drop(queue);
                if entry.handle.is_cancelled() {
                    trace!("skipping cancelled timer");
                } else {
                    (entry.wake)();
                }
            }
        }
    }
    debug!("timer thread exiting");
}

static GLOBAL_TIMER: OnceLock<SystemTimer> = OnceLock::new();

/// The process-wide timer driver, started on first use.
pub fn global_timer() -> &'static SystemTimer {
    GLOBAL_TIMER.get_or_init(SystemTimer::new)
}
