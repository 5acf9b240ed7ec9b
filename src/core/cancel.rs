//! Cooperative cancellation tokens.
//!
//! A [`CancelToken`] is a monotone flag: once set it never resets.
//! Cancellation is advisory - a cancelled task only stops once it reaches a
//! checkpoint (an explicit [`CancelToken::check`], entry to a blocking
//! channel operation, or completion). Tokens form a tree: cancelling a
//! parent cancels every descendant, and only in that direction.
//!
//! Acquire/release ordering is sufficient here: the flag is monotone and no
//! dependent state has to be observed atomically with it, so nothing is
//! gained by sequentially-consistent loads on the hot `is_cancelled` path.

use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::core::error::JoinError;

/// A wake callback invoked when the token is cancelled, so threads parked in
/// blocking waits re-check the flag instead of sleeping through it.
pub(crate) type WakeTarget = Arc<dyn Fn() + Send + Sync + 'static>;

static WAKER_KEYS: AtomicU64 = AtomicU64::new(1);

struct Inner {
    cancelled: AtomicBool,
    children: Mutex<Vec<Weak<Inner>>>,
    wakers: Mutex<Vec<(u64, WakeTarget)>>,
}

impl Inner {
    fn new() -> Self {
        Self {
            cancelled: AtomicBool::new(false),
            children: Mutex::new(Vec::new()),
            wakers: Mutex::new(Vec::new()),
        }
    }

    fn cancel(self: &Arc<Self>) {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }

        // Callbacks and child propagation run outside the locks; a waker may
        // touch channel internals and a child may be cancelled concurrently.
        let wakers: Vec<(u64, WakeTarget)> = std::mem::take(&mut *self.wakers.lock());
        for (_, wake) in wakers {
            wake();
        }

        let children: Vec<Weak<Inner>> = std::mem::take(&mut *self.children.lock());
        for child in children {
            if let Some(child) = child.upgrade() {
                child.cancel();
            }
        }
    }
}

/// A shared flag for cooperative cancellation.
///
/// Cloning a token yields another handle to the *same* flag; use
/// [`child`](Self::child) for a linked-but-separate token.
///
/// # Example
///
/// ```rust,ignore
/// fn long_running(cancel: &CancelToken) -> Result<u64, JoinError> {
///     let mut acc = 0;
///     for chunk in 0..1024 {
///         cancel.check()?;
///         acc += work(chunk);
///     }
///     Ok(acc)
/// }
/// ```
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

impl CancelToken {
    /// Create a new, uncancelled token.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner::new()),
        }
    }

    /// Whether cancellation has been requested. Lock-free acquire load.
    #[inline]
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Request cancellation. Idempotent; propagates to every descendant
    /// token and wakes blocked waiters registered on this token.
    pub fn cancel(&self) {
        self.inner.cancel();
    }

    /// Cancellation checkpoint: returns `Err(JoinError::Cancelled)` once the
    /// token has been cancelled.
    ///
    /// # Errors
    ///
    /// [`JoinError::Cancelled`] if the token is cancelled.
    pub fn check(&self) -> Result<(), JoinError> {
        if self.is_cancelled() {
            Err(JoinError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Create a child token. Cancelling `self` cancels the child (and its
    /// descendants); cancelling the child never affects `self`.
    #[must_use]
    pub fn child(&self) -> Self {
        let child = Self::new();
        if self.is_cancelled() {
            child.cancel();
            return child;
        }

        self.inner.children.lock().push(Arc::downgrade(&child.inner));

        // The parent may have drained its child list between the flag check
        // and the push; a second check makes the race benign.
        if self.is_cancelled() {
            child.cancel();
        }
        child
    }

    /// Register a wake callback fired once on cancellation. The registration
    /// is removed when the returned guard drops.
    pub(crate) fn register_waker(&self, wake: WakeTarget) -> WakerRegistration {
        let key = WAKER_KEYS.fetch_add(1, Ordering::Relaxed);
        self.inner.wakers.lock().push((key, wake));
        WakerRegistration {
            inner: Arc::clone(&self.inner),
            key,
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Guard removing a cancellation waker when a blocking wait ends.
pub(crate) struct WakerRegistration {
    inner: Arc<Inner>,
    key: u64,
}

impl Drop for WakerRegistration {
    fn drop(&mut self) {
        self.inner.wakers.lock().retain(|(key, _)| *key != self.key);
    }
}

thread_local! {
    static CURRENT: RefCell<Option<CancelToken>> = const { RefCell::new(None) };
}

/// The cancel token of the task currently running on this thread, if any.
///
/// Set by the scheduler for the duration of each task body. Channel
/// operations consult it to make blocking-entry a cancellation checkpoint.
#[must_use]
pub fn current_token() -> Option<CancelToken> {
    CURRENT.with(|slot| slot.borrow().clone())
}

/// Run `f` with `token` installed as this thread's current token, restoring
/// the previous token on exit (including unwinds).
pub(crate) fn with_current_token<R>(token: &CancelToken, f: impl FnOnce() -> R) -> R {
    struct Restore(Option<CancelToken>);
    impl Drop for Restore {
        fn drop(&mut self) {
            let prev = self.0.take();
            CURRENT.with(|slot| *slot.borrow_mut() = prev);
        }
    }

    let prev = CURRENT.with(|slot| slot.borrow_mut().replace(token.clone()));
    let _restore = Restore(prev);
    f()
}
