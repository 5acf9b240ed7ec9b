//! Fair, multiplexed waiting across multiple channel operations.
//!
//! [`Select`] registers interest on every operand, parks until one becomes
//! ready, and deregisters from the rest on exit. When several operands are
//! ready at once, the winner is chosen uniformly at random - fairness is a
//! contract here, not an implementation accident, and it is re-sampled on
//! every wake so no operand can be starved by position.
//!
//! `ready` blocks, [`Select::try_ready`] is the `default` arm, and
//! [`Select::ready_timeout`] is the timer arm.
//!
//! A ready index is a *hint*: another thread may win the race before the
//! caller performs the operation. Pair `ready` with `try_recv`/`try_send`
//! and retry on [`ChannelError::Empty`]/[`ChannelError::Full`], as the
//! two-channel helpers in this module do.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use rand::Rng;

use crate::core::cancel::{current_token, CancelToken, WakerRegistration};
use crate::core::error::ChannelError;

use super::{ChannelResult, Receiver, Sender};

static SELECT_KEYS: AtomicU64 = AtomicU64::new(1);

/// Wake flag shared between a parked `Select` and the channels (and cancel
/// tokens) it watches. The flag is set under the mutex so a notification
/// cannot slip between a readiness poll and the park.
pub(crate) struct SelectSignal {
    ready: Mutex<bool>,
    cv: Condvar,
}

impl SelectSignal {
    fn new() -> Self {
        Self {
            ready: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    pub(crate) fn notify(&self) {
        let mut ready = self.ready.lock();
        *ready = true;
        self.cv.notify_all();
    }
}

/// One registered operation, type-erased over the element type.
trait Operand {
    fn is_ready(&self) -> bool;
    fn attach(&self, key: u64, signal: &Arc<SelectSignal>);
    fn detach(&self, key: u64);
}

struct RecvOp<'a, T>(&'a Receiver<T>);

impl<T: Send + 'static> Operand for RecvOp<'_, T> {
    fn is_ready(&self) -> bool {
        self.0.can_recv()
    }

    fn attach(&self, key: u64, signal: &Arc<SelectSignal>) {
        self.0.add_selector(key, signal);
    }

    fn detach(&self, key: u64) {
        self.0.remove_selector(key);
    }
}

struct SendOp<'a, T>(&'a Sender<T>);

impl<T: Send + 'static> Operand for SendOp<'_, T> {
    fn is_ready(&self) -> bool {
        self.0.can_send()
    }

    fn attach(&self, key: u64, signal: &Arc<SelectSignal>) {
        self.0.add_selector(key, signal);
    }

    fn detach(&self, key: u64) {
        self.0.remove_selector(key);
    }
}

/// A dynamic select over receive and send operations.
///
/// Blocking waits are cancellation checkpoints: if the calling task's token
/// is cancelled, `ready`/`ready_timeout` return
/// [`ChannelError::Cancelled`] instead of sleeping through it.
///
/// # Example
///
/// ```rust,ignore
/// let mut sel = Select::new();
/// let from_a = sel.recv(&rx_a);
/// let from_b = sel.recv(&rx_b);
/// let idx = sel.ready()?;
/// if idx == from_a { /* rx_a.try_recv() ... */ }
/// ```
pub struct Select<'a> {
    ops: Vec<Box<dyn Operand + 'a>>,
    signal: Arc<SelectSignal>,
    key: u64,
}

impl<'a> Select<'a> {
    /// Create an empty select set.
    #[must_use]
    pub fn new() -> Self {
        Self {
            ops: Vec::new(),
            signal: Arc::new(SelectSignal::new()),
            key: SELECT_KEYS.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Add a receive operation; returns the index assigned to it.
    pub fn recv<T: Send + 'static>(&mut self, receiver: &'a Receiver<T>) -> usize {
        self.ops.push(Box::new(RecvOp(receiver)));
        self.ops.len() - 1
    }

    /// Add a send operation; returns the index assigned to it.
    ///
    /// The operation is "ready" when a send would complete or fail without
    /// parking (space available, a parked rendezvous receiver, or a
    /// closed/disconnected channel).
    pub fn send<T: Send + 'static>(&mut self, sender: &'a Sender<T>) -> usize {
        self.ops.push(Box::new(SendOp(sender)));
        self.ops.len() - 1
    }

    /// Block until an operation is ready and return its index.
    ///
    /// # Errors
    ///
    /// [`ChannelError::Cancelled`] if the calling task's token is cancelled.
    ///
    /// # Panics
    ///
    /// Panics if no operations have been added.
    pub fn ready(&mut self) -> ChannelResult<usize> {
        self.wait(None)
            .map(|idx| idx.expect("untimed select wait always yields an index"))
    }

    /// Poll once without blocking; `None` if nothing is ready. This is the
    /// `default` arm of a select.
    #[must_use]
    pub fn try_ready(&mut self) -> Option<usize> {
        self.pick_ready()
    }

    /// Block until an operation is ready or the timeout elapses.
    /// `Ok(None)` means the timeout fired first.
    ///
    /// # Errors
    ///
    /// [`ChannelError::Cancelled`] if the calling task's token is cancelled.
    ///
    /// # Panics
    ///
    /// Panics if no operations have been added.
    pub fn ready_timeout(&mut self, timeout: Duration) -> ChannelResult<Option<usize>> {
        self.wait(Some(Instant::now() + timeout))
    }

    /// Uniform random choice among the currently-ready operations.
    fn pick_ready(&self) -> Option<usize> {
        let ready: Vec<usize> = self
            .ops
            .iter()
            .enumerate()
            .filter(|(_, op)| op.is_ready())
            .map(|(idx, _)| idx)
            .collect();
        match ready.len() {
            0 => None,
            1 => Some(ready[0]),
            n => Some(ready[rand::rng().random_range(0..n)]),
        }
    }

    fn wait(&mut self, deadline: Option<Instant>) -> ChannelResult<Option<usize>> {
        assert!(!self.ops.is_empty(), "select on an empty operation set");

        let token = current_token();
        let _cancel_wake: Option<WakerRegistration> = token.as_ref().map(|t| {
            let signal = Arc::clone(&self.signal);
            t.register_waker(Arc::new(move || signal.notify()))
        });

        for op in &self.ops {
            op.attach(self.key, &self.signal);
        }
        let result = self.wait_loop(deadline, token.as_ref());
        for op in &self.ops {
            op.detach(self.key);
        }
        result
    }

    fn wait_loop(
        &self,
        deadline: Option<Instant>,
        token: Option<&CancelToken>,
    ) -> ChannelResult<Option<usize>> {
        loop {
            if let Some(idx) = self.pick_ready() {
                return Ok(Some(idx));
            }
            if token.is_some_and(CancelToken::is_cancelled) {
                return Err(ChannelError::Cancelled);
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return Ok(None);
                }
            }

            let mut flag = self.signal.ready.lock();
            if !*flag {
                match deadline {
                    Some(deadline) => {
                        let _ = self.signal.cv.wait_until(&mut flag, deadline);
                    }
                    None => self.signal.cv.wait(&mut flag),
                }
            }
            *flag = false;
        }
    }
}

impl Default for Select<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Select<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Select")
            .field("operations", &self.ops.len())
            .finish()
    }
}

/// Outcome of a two-channel receive select.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Select2Result<T1, T2> {
    /// The first channel yielded a value.
    First(T1),
    /// The second channel yielded a value.
    Second(T2),
    /// The first channel is closed and drained.
    FirstClosed,
    /// The second channel is closed and drained.
    SecondClosed,
}

impl<T1, T2> Select2Result<T1, T2> {
    /// Whether the first channel won.
    #[must_use]
    pub const fn is_first(&self) -> bool {
        matches!(self, Self::First(_))
    }

    /// Whether the second channel won.
    #[must_use]
    pub const fn is_second(&self) -> bool {
        matches!(self, Self::Second(_))
    }
}

/// Receive from whichever of two channels is ready first, blocking until one
/// is.
///
/// # Errors
///
/// [`ChannelError::Cancelled`] if the calling task's token is cancelled.
pub fn select2_recv<T1, T2>(
    rx1: &Receiver<T1>,
    rx2: &Receiver<T2>,
) -> ChannelResult<Select2Result<T1, T2>>
where
    T1: Send + 'static,
    T2: Send + 'static,
{
    let mut sel = Select::new();
    let first = sel.recv(rx1);
    let _second = sel.recv(rx2);
    loop {
        let idx = sel.ready()?;
        if let Some(outcome) = resolve2(idx == first, rx1, rx2)? {
            return Ok(outcome);
        }
    }
}

/// Non-blocking variant of [`select2_recv`]; `None` if neither channel is
/// ready.
///
/// # Errors
///
/// Never fails today; the `Result` mirrors [`select2_recv`] for symmetry.
pub fn try_select2_recv<T1, T2>(
    rx1: &Receiver<T1>,
    rx2: &Receiver<T2>,
) -> ChannelResult<Option<Select2Result<T1, T2>>>
where
    T1: Send + 'static,
    T2: Send + 'static,
{
    let mut sel = Select::new();
    let first = sel.recv(rx1);
    let _second = sel.recv(rx2);
    loop {
        let Some(idx) = sel.try_ready() else {
            return Ok(None);
        };
        if let Some(outcome) = resolve2(idx == first, rx1, rx2)? {
            return Ok(Some(outcome));
        }
    }
}

/// Timed variant of [`select2_recv`]; `Ok(None)` if the timeout elapses.
///
/// # Errors
///
/// [`ChannelError::Cancelled`] if the calling task's token is cancelled.
pub fn select2_recv_timeout<T1, T2>(
    rx1: &Receiver<T1>,
    rx2: &Receiver<T2>,
    timeout: Duration,
) -> ChannelResult<Option<Select2Result<T1, T2>>>
where
    T1: Send + 'static,
    T2: Send + 'static,
{
    let deadline = Instant::now() + timeout;
    let mut sel = Select::new();
    let first = sel.recv(rx1);
    let _second = sel.recv(rx2);
    loop {
        let now = Instant::now();
        if now >= deadline {
            return Ok(None);
        }
        let Some(idx) = sel.ready_timeout(deadline - now)? else {
            return Ok(None);
        };
        if let Some(outcome) = resolve2(idx == first, rx1, rx2)? {
            return Ok(Some(outcome));
        }
    }
}

/// Attempt the operation a ready hint pointed at; `None` means the hint went
/// stale (another receiver won) and the select should retry.
fn resolve2<T1, T2>(
    first_won: bool,
    rx1: &Receiver<T1>,
    rx2: &Receiver<T2>,
) -> ChannelResult<Option<Select2Result<T1, T2>>>
where
    T1: Send + 'static,
    T2: Send + 'static,
{
    if first_won {
        match rx1.try_recv() {
            Ok(value) => Ok(Some(Select2Result::First(value))),
            Err(ChannelError::Empty) => Ok(None),
            Err(ChannelError::Closed) => Ok(Some(Select2Result::FirstClosed)),
            Err(err) => Err(err),
        }
    } else {
        match rx2.try_recv() {
            Ok(value) => Ok(Some(Select2Result::Second(value))),
            Err(ChannelError::Empty) => Ok(None),
            Err(ChannelError::Closed) => Ok(Some(Select2Result::SecondClosed)),
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{bounded, unbounded};
    use std::thread;

    #[test]
    fn test_ready_returns_ready_operand() {
        let (tx1, rx1) = bounded::<i32>(4);
        let (_tx2, rx2) = bounded::<i32>(4);
        tx1.send(42).unwrap();

        let mut sel = Select::new();
        let first = sel.recv(&rx1);
        let _second = sel.recv(&rx2);
        assert_eq!(sel.ready().unwrap(), first);
        assert_eq!(rx1.try_recv(), Ok(42));
    }

    #[test]
    fn test_try_ready_none_when_idle() {
        let (_tx, rx) = bounded::<i32>(4);
        let mut sel = Select::new();
        sel.recv(&rx);
        assert!(sel.try_ready().is_none());
    }

    #[test]
    fn test_try_ready_after_send() {
        let (tx, rx) = bounded::<i32>(4);
        let mut sel = Select::new();
        sel.recv(&rx);
        assert!(sel.try_ready().is_none());
        tx.send(1).unwrap();
        assert!(sel.try_ready().is_some());
    }

    #[test]
    fn test_ready_timeout_elapses() {
        let (_tx, rx) = bounded::<i32>(4);
        let mut sel = Select::new();
        sel.recv(&rx);

        let start = Instant::now();
        let result = sel.ready_timeout(Duration::from_millis(50)).unwrap();
        assert!(result.is_none());
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_ready_wakes_on_concurrent_send() {
        let (tx, rx) = unbounded::<i32>();
        let sender = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            tx.send(5).unwrap();
        });

        let mut sel = Select::new();
        let idx = sel.recv(&rx);
        assert_eq!(sel.ready().unwrap(), idx);
        assert_eq!(rx.try_recv(), Ok(5));
        sender.join().unwrap();
    }

    #[test]
    fn test_send_operand_ready_when_space() {
        let (tx, rx) = bounded::<i32>(1);
        tx.send(1).unwrap();

        let mut sel = Select::new();
        sel.send(&tx);
        assert!(sel.try_ready().is_none());

        rx.recv().unwrap();
        assert!(sel.try_ready().is_some());
        assert!(tx.try_send(2).is_ok());
    }

    #[test]
    fn test_closed_channel_is_ready() {
        let (tx, rx) = bounded::<i32>(4);
        tx.close();

        let mut sel = Select::new();
        let idx = sel.recv(&rx);
        assert_eq!(sel.ready().unwrap(), idx);
        assert_eq!(rx.try_recv(), Err(ChannelError::Closed));
    }

    #[test]
    fn test_select2_recv_prefers_ready_side() {
        let (tx1, rx1) = bounded::<i32>(4);
        let (tx2, rx2) = bounded::<String>(4);

        tx1.send(42).unwrap();
        match select2_recv(&rx1, &rx2).unwrap() {
            Select2Result::First(v) => assert_eq!(v, 42),
            other => panic!("expected First, got {other:?}"),
        }

        tx2.send("hello".to_string()).unwrap();
        match select2_recv(&rx1, &rx2).unwrap() {
            Select2Result::Second(v) => assert_eq!(v, "hello"),
            other => panic!("expected Second, got {other:?}"),
        }
    }

    #[test]
    fn test_select2_reports_closed() {
        let (tx1, rx1) = bounded::<i32>(4);
        let (_tx2, rx2) = bounded::<i32>(4);
        drop(tx1);

        assert_eq!(
            select2_recv(&rx1, &rx2).unwrap(),
            Select2Result::FirstClosed
        );
    }

    #[test]
    fn test_both_ready_both_sides_reachable() {
        let (tx1, rx1) = unbounded::<u8>();
        let (tx2, rx2) = unbounded::<u8>();

        let mut saw_first = false;
        let mut saw_second = false;
        for _ in 0..200 {
            tx1.send(1).unwrap();
            tx2.send(2).unwrap();
            match select2_recv(&rx1, &rx2).unwrap() {
                Select2Result::First(_) => saw_first = true,
                Select2Result::Second(_) => saw_second = true,
                other => panic!("unexpected {other:?}"),
            }
            // Drain so both are freshly ready next round.
            let _ = rx1.try_recv();
            let _ = rx2.try_recv();
        }
        assert!(saw_first && saw_second, "random choice never hit one side");
    }
}
