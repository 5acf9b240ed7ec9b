//! Timer and I/O driver seams.
//!
//! The runtime core owns no clock and no event loop. Deadlines and I/O
//! readiness are supplied by the host through these traits: the core calls
//! `register` and consumes wake-ups, nothing more. A default thread-backed
//! [`TimerDriver`] implementation ([`timer::SystemTimer`]) is provided; an
//! [`IoDriver`] must come from the host (epoll/kqueue/IOCP abstraction).

pub mod timer;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

pub use timer::{global_timer, SystemTimer};

/// A one-shot wake callback handed to a driver.
pub type WakeFn = Box<dyn FnOnce() + Send + 'static>;

/// Handle to a registered timer. Cancelling prevents the wake callback from
/// firing; a callback already running is not interrupted.
#[derive(Clone)]
pub struct TimerHandle {
    cancelled: Arc<AtomicBool>,
}

impl TimerHandle {
    /// Create a live (uncancelled) handle. Drivers keep a clone alongside
    /// the registered entry and check it before firing.
    #[must_use]
    pub fn new() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Cancel the timer. Returns `true` if this call performed the
    /// cancellation, `false` if it was already cancelled.
    pub fn cancel(&self) -> bool {
        !self.cancelled.swap(true, Ordering::AcqRel)
    }

    /// Whether the timer has been cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

impl Default for TimerHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TimerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerHandle")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Source of wake-at-deadline notifications.
pub trait TimerDriver: Send + Sync + 'static {
    /// Register `wake` to run at or shortly after `deadline`. The returned
    /// handle cancels the registration.
    fn register(&self, deadline: Instant, wake: WakeFn) -> TimerHandle;
}

/// Readiness interest for an I/O source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    /// Wake when the source becomes readable.
    Readable,
    /// Wake when the source becomes writable.
    Writable,
}

/// Opaque identifier for a host I/O source (a file descriptor, socket
/// handle, or completion key - the core never interprets it).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawSource(pub u64);

/// Source of I/O readiness notifications, supplied by the host.
///
/// The core registers interest and consumes wake-ups; polling, edge/level
/// semantics, and deregistration-on-close are the host's concern.
pub trait IoDriver: Send + Sync + 'static {
    /// Register `wake` to run once `source` satisfies `interest`.
    fn register(&self, source: RawSource, interest: Interest, wake: WakeFn);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timer_handle_cancel_once() {
        let handle = TimerHandle::new();
        assert!(!handle.is_cancelled());
        assert!(handle.cancel());
        assert!(!handle.cancel());
        assert!(handle.is_cancelled());
    }

    #[test]
    fn test_timer_handle_clone_shares_flag() {
        let a = TimerHandle::new();
        let b = a.clone();
        a.cancel();
        assert!(b.is_cancelled());
    }
}
