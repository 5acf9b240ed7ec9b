//! Typed channels for inter-task communication.
//!
//! Channels are the only cross-task data path in the runtime. Three shapes
//! share one implementation:
//!
//! - **Rendezvous** (capacity 0): `send` completes only once a receiver has
//!   taken that exact value; nothing is ever buffered.
//! - **Bounded** (capacity N): a FIFO ring; `send` blocks while full.
//! - **Unbounded**: a growable FIFO; `send` never blocks.
//!
//! Within a single sender/receiver pair, values arrive in send order. Across
//! senders, only each sender's own order is preserved.
//!
//! Entry to a blocking `send`/`recv` is a cancellation checkpoint: if the
//! calling task's [`CancelToken`](crate::core::CancelToken) is cancelled, the
//! operation returns [`ChannelError::Cancelled`] instead of parking, and a
//! parked operation is woken when cancellation arrives.
//!
//! # Example
//!
//! ```rust,ignore
//! let (tx, rx) = strand::channel::bounded::<u32>(8);
//! std::thread::spawn(move || {
//!     for i in 0..4 {
//!         tx.send(i).unwrap();
//!     }
//! });
//! assert_eq!(rx.recv().unwrap(), 0);
//! ```

pub mod select;

use std::collections::VecDeque;
use std::sync::{Arc, Weak};

use parking_lot::{Condvar, Mutex};
use tracing::trace;

use crate::core::cancel::{current_token, CancelToken, WakeTarget, WakerRegistration};

use self::select::SelectSignal;

pub use crate::core::error::ChannelError;

/// Result type for channel operations.
pub type ChannelResult<T> = Result<T, ChannelError>;

struct State<T> {
    /// FIFO buffer for bounded/unbounded channels. Unused at capacity 0.
    buffer: VecDeque<T>,
    /// Rendezvous handoff slot; holds at most the one value currently being
    /// handed over. Not a buffered item.
    slot: Option<T>,
    /// Sequence number of the value in `slot`, so the sender that placed it
    /// can tell whether *its* value was taken.
    slot_seq: u64,
    next_seq: u64,
    closed: bool,
    senders: usize,
    receivers: usize,
    /// Receivers currently parked in `recv`; gates rendezvous `try_send`.
    waiting_receivers: usize,
}

struct Shared<T> {
    /// `None` = unbounded, `Some(0)` = rendezvous, `Some(n)` = ring of n.
    capacity: Option<usize>,
    state: Mutex<State<T>>,
    /// Space freed, handoff completed, or channel closed.
    send_ready: Condvar,
    /// Value available or channel closed.
    recv_ready: Condvar,
    /// Parked `Select`s interested in this channel.
    selectors: Mutex<Vec<(u64, Weak<SelectSignal>)>>,
}

impl<T> Shared<T> {
    fn new(capacity: Option<usize>) -> Self {
        Self {
            capacity,
            state: Mutex::new(State {
                buffer: VecDeque::new(),
                slot: None,
                slot_seq: 0,
                next_seq: 1,
                closed: false,
                senders: 1,
                receivers: 1,
                waiting_receivers: 0,
            }),
            send_ready: Condvar::new(),
            recv_ready: Condvar::new(),
            selectors: Mutex::new(Vec::new()),
        }
    }

    const fn is_rendezvous(&self) -> bool {
        matches!(self.capacity, Some(0))
    }

    fn has_space(&self, state: &State<T>) -> bool {
        match self.capacity {
            None => true,
            Some(0) => false,
            Some(n) => state.buffer.len() < n,
        }
    }

    /// Wake every parked `Select` watching this channel, pruning dead ones.
    fn notify_selectors(&self) {
        let mut selectors = self.selectors.lock();
        selectors.retain(|(_, weak)| {
            weak.upgrade().map_or(false, |signal| {
                signal.notify();
                true
            })
        });
    }

    fn add_selector(&self, key: u64, signal: &Arc<SelectSignal>) {
        self.selectors.lock().push((key, Arc::downgrade(signal)));
    }

    fn remove_selector(&self, key: u64) {
        self.selectors.lock().retain(|(k, _)| *k != key);
    }

    fn mark_closed(&self, state: &mut State<T>) {
        if !state.closed {
            state.closed = true;
            self.send_ready.notify_all();
            self.recv_ready.notify_all();
            self.notify_selectors();
        }
    }
}

impl<T: Send + 'static> Shared<T> {
    /// Cancellation waker: takes the state lock so a waiter between its
    /// token check and its `wait` is parked before the notification lands.
    fn wake_handle(self: &Arc<Self>) -> WakeTarget {
        let shared = Arc::clone(self);
        Arc::new(move || {
            drop(shared.state.lock());
            shared.send_ready.notify_all();
            shared.recv_ready.notify_all();
        })
    }
}

/// Checkpoint helper shared by the blocking paths: checks the flag and
/// lazily registers the channel waker with the current token.
struct Checkpoint {
    token: Option<CancelToken>,
    registration: Option<WakerRegistration>,
}

impl Checkpoint {
    fn at_entry() -> ChannelResult<Self> {
        let token = current_token();
        if token.as_ref().is_some_and(CancelToken::is_cancelled) {
            return Err(ChannelError::Cancelled);
        }
        Ok(Self {
            token,
            registration: None,
        })
    }

    fn recheck(&self) -> ChannelResult<()> {
        if self.token.as_ref().is_some_and(CancelToken::is_cancelled) {
            return Err(ChannelError::Cancelled);
        }
        Ok(())
    }

    fn arm(&mut self, wake: impl FnOnce() -> WakeTarget) {
        if self.registration.is_none() {
            if let Some(token) = &self.token {
                self.registration = Some(token.register_waker(wake()));
            }
        }
    }
}

/// The sending half of a channel. Clonable; the channel closes when the last
/// sender drops.
pub struct Sender<T> {
    shared: Arc<Shared<T>>,
}

/// The receiving half of a channel. Clonable; senders observe
/// [`ChannelError::Disconnected`] once every receiver is gone.
pub struct Receiver<T> {
    shared: Arc<Shared<T>>,
}

/// Create a bounded channel. Capacity `0` is a rendezvous channel.
#[must_use]
pub fn bounded<T: Send + 'static>(capacity: usize) -> (Sender<T>, Receiver<T>) {
    let shared = Arc::new(Shared::new(Some(capacity)));
    (
        Sender {
            shared: Arc::clone(&shared),
        },
        Receiver { shared },
    )
}

/// Create an unbounded channel; `send` never blocks.
#[must_use]
pub fn unbounded<T: Send + 'static>() -> (Sender<T>, Receiver<T>) {
    let shared = Arc::new(Shared::new(None));
    (
        Sender {
            shared: Arc::clone(&shared),
        },
        Receiver { shared },
    )
}

/// Create a rendezvous channel; equivalent to [`bounded`]`(0)`.
#[must_use]
pub fn rendezvous<T: Send + 'static>() -> (Sender<T>, Receiver<T>) {
    bounded(0)
}

impl<T: Send + 'static> Sender<T> {
    /// Send a value, blocking while the channel is full (or, for a
    /// rendezvous channel, until a receiver has taken the value).
    ///
    /// # Errors
    ///
    /// - [`ChannelError::Closed`] if the channel is closed.
    /// - [`ChannelError::Disconnected`] if every receiver has been dropped.
    /// - [`ChannelError::Cancelled`] if the calling task's token is
    ///   cancelled at or during this checkpoint.
    pub fn send(&self, value: T) -> ChannelResult<()> {
        if self.shared.is_rendezvous() {
            return self.send_rendezvous(value);
        }

        let mut checkpoint = Checkpoint::at_entry()?;
        let mut state = self.shared.state.lock();
        loop {
            checkpoint.recheck()?;
            if state.closed {
                return Err(ChannelError::Closed);
            }
            if state.receivers == 0 {
                return Err(ChannelError::Disconnected);
            }
            if self.shared.has_space(&state) {
                state.buffer.push_back(value);
                self.shared.recv_ready.notify_one();
                self.shared.notify_selectors();
                return Ok(());
            }
            checkpoint.arm(|| self.shared.wake_handle());
            self.shared.send_ready.wait(&mut state);
        }
    }

    /// Rendezvous path: place the value in the handoff slot, then wait for a
    /// receiver to take that exact value (tracked by sequence number).
    fn send_rendezvous(&self, value: T) -> ChannelResult<()> {
        let mut checkpoint = Checkpoint::at_entry()?;
        let mut state = self.shared.state.lock();

        // Phase 1: wait for the slot to be free.
        loop {
            checkpoint.recheck()?;
            if state.closed {
                return Err(ChannelError::Closed);
            }
            if state.receivers == 0 {
                return Err(ChannelError::Disconnected);
            }
            if state.slot.is_none() {
                break;
            }
            checkpoint.arm(|| self.shared.wake_handle());
            self.shared.send_ready.wait(&mut state);
        }

        let seq = state.next_seq;
        state.next_seq += 1;
        state.slot = Some(value);
        state.slot_seq = seq;
        self.shared.recv_ready.notify_one();
        self.shared.notify_selectors();

        // Phase 2: wait until our value has been taken.
        loop {
            if state.slot.is_none() || state.slot_seq != seq {
                return Ok(());
            }
            if state.closed {
                state.slot = None;
                self.shared.send_ready.notify_all();
                return Err(ChannelError::Closed);
            }
            if state.receivers == 0 {
                state.slot = None;
                self.shared.send_ready.notify_all();
                return Err(ChannelError::Disconnected);
            }
            if checkpoint.recheck().is_err() {
                state.slot = None;
                self.shared.send_ready.notify_all();
                return Err(ChannelError::Cancelled);
            }
            checkpoint.arm(|| self.shared.wake_handle());
            self.shared.send_ready.wait(&mut state);
        }
    }

    /// Send without blocking.
    ///
    /// On a rendezvous channel this succeeds only when a receiver is already
    /// parked in `recv`, in which case the value is handed directly to it.
    ///
    /// # Errors
    ///
    /// [`ChannelError::Full`] if the value cannot be accepted right now;
    /// [`ChannelError::Closed`]/[`ChannelError::Disconnected`] as for
    /// [`send`](Self::send).
    pub fn try_send(&self, value: T) -> ChannelResult<()> {
        let mut state = self.shared.state.lock();
        if state.closed {
            return Err(ChannelError::Closed);
        }
        if state.receivers == 0 {
            return Err(ChannelError::Disconnected);
        }

        if self.shared.is_rendezvous() {
            if state.waiting_receivers > 0 && state.slot.is_none() {
                let seq = state.next_seq;
                state.next_seq += 1;
                state.slot = Some(value);
                state.slot_seq = seq;
                self.shared.recv_ready.notify_one();
                self.shared.notify_selectors();
                return Ok(());
            }
            return Err(ChannelError::Full);
        }

        if self.shared.has_space(&state) {
            state.buffer.push_back(value);
            self.shared.recv_ready.notify_one();
            self.shared.notify_selectors();
            return Ok(());
        }
        Err(ChannelError::Full)
    }

    /// Close the channel. Buffered values remain receivable until drained;
    /// further sends fail with [`ChannelError::Closed`]. Idempotent.
    pub fn close(&self) {
        let mut state = self.shared.state.lock();
        trace!("channel closed by sender");
        self.shared.mark_closed(&mut state);
    }

    /// Whether the channel has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    /// Readiness probe for `Select`: a send would complete (or fail)
    /// without parking.
    pub(crate) fn can_send(&self) -> bool {
        let state = self.shared.state.lock();
        if state.closed || state.receivers == 0 {
            return true;
        }
        if self.shared.is_rendezvous() {
            return state.waiting_receivers > 0 && state.slot.is_none();
        }
        self.shared.has_space(&state)
    }

    pub(crate) fn add_selector(&self, key: u64, signal: &Arc<SelectSignal>) {
        self.shared.add_selector(key, signal);
    }

    pub(crate) fn remove_selector(&self, key: u64) {
        self.shared.remove_selector(key);
    }
}

impl<T> Clone for Sender<T> {
    fn clone(&self) -> Self {
        self.shared.state.lock().senders += 1;
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> Drop for Sender<T> {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock();
        state.senders -= 1;
        if state.senders == 0 {
            trace!("last sender dropped, closing channel");
            self.shared.mark_closed(&mut state);
        }
    }
}

impl<T: Send + 'static> Receiver<T> {
    /// Receive a value, blocking until one is available.
    ///
    /// # Errors
    ///
    /// - [`ChannelError::Closed`] once the channel is closed *and* drained.
    /// - [`ChannelError::Cancelled`] if the calling task's token is
    ///   cancelled at or during this checkpoint.
    pub fn recv(&self) -> ChannelResult<T> {
        let mut checkpoint = Checkpoint::at_entry()?;
        let mut state = self.shared.state.lock();
        loop {
            checkpoint.recheck()?;
            if let Some(value) = state.buffer.pop_front() {
                self.shared.send_ready.notify_one();
                self.shared.notify_selectors();
                return Ok(value);
            }
            if let Some(value) = state.slot.take() {
                // Completes a rendezvous handoff; wake the paired sender.
                self.shared.send_ready.notify_all();
                self.shared.notify_selectors();
                return Ok(value);
            }
            if state.closed {
                return Err(ChannelError::Closed);
            }
            checkpoint.arm(|| self.shared.wake_handle());
            state.waiting_receivers += 1;
            self.shared.recv_ready.wait(&mut state);
            state.waiting_receivers -= 1;
        }
    }

    /// Receive without blocking.
    ///
    /// # Errors
    ///
    /// [`ChannelError::Empty`] if no value is ready;
    /// [`ChannelError::Closed`] once closed and drained.
    pub fn try_recv(&self) -> ChannelResult<T> {
        let mut state = self.shared.state.lock();
        if let Some(value) = state.buffer.pop_front() {
            self.shared.send_ready.notify_one();
            self.shared.notify_selectors();
            return Ok(value);
        }
        if let Some(value) = state.slot.take() {
            self.shared.send_ready.notify_all();
            self.shared.notify_selectors();
            return Ok(value);
        }
        if state.closed {
            return Err(ChannelError::Closed);
        }
        Err(ChannelError::Empty)
    }

    /// Number of buffered values. In-flight rendezvous handoffs do not
    /// count: a capacity-0 channel always reports 0.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shared.state.lock().buffer.len()
    }

    /// Whether no buffered values are available.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the channel has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    /// Readiness probe for `Select`: a recv would complete (or fail)
    /// without parking.
    pub(crate) fn can_recv(&self) -> bool {
        let state = self.shared.state.lock();
        !state.buffer.is_empty() || state.slot.is_some() || state.closed
    }

    pub(crate) fn add_selector(&self, key: u64, signal: &Arc<SelectSignal>) {
        self.shared.add_selector(key, signal);
    }

    pub(crate) fn remove_selector(&self, key: u64) {
        self.shared.remove_selector(key);
    }
}

impl<T> Clone for Receiver<T> {
    fn clone(&self) -> Self {
        self.shared.state.lock().receivers += 1;
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> Drop for Receiver<T> {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock();
        state.receivers -= 1;
        if state.receivers == 0 {
            trace!("last receiver dropped");
            // Senders parked on space or handoff must observe Disconnected.
            self.shared.send_ready.notify_all();
            self.shared.notify_selectors();
        }
    }
}

/// Blocking iterator over received values; ends when the channel is closed
/// and drained.
pub struct IntoIter<T> {
    receiver: Receiver<T>,
}

impl<T: Send + 'static> Iterator for IntoIter<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        self.receiver.recv().ok()
    }
}

impl<T: Send + 'static> IntoIterator for Receiver<T> {
    type Item = T;
    type IntoIter = IntoIter<T>;

    fn into_iter(self) -> IntoIter<T> {
        IntoIter { receiver: self }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::cancel::with_current_token;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_bounded_send_recv_in_order() {
        let (tx, rx) = bounded::<i32>(8);
        for i in 0..5 {
            tx.send(i).unwrap();
        }
        for i in 0..5 {
            assert_eq!(rx.recv().unwrap(), i);
        }
    }

    #[test]
    fn test_unbounded_never_blocks() {
        let (tx, rx) = unbounded::<usize>();
        for i in 0..10_000 {
            tx.send(i).unwrap();
        }
        assert_eq!(rx.len(), 10_000);
        assert_eq!(rx.recv().unwrap(), 0);
    }

    #[test]
    fn test_try_send_full_and_try_recv_empty() {
        let (tx, rx) = bounded::<i32>(2);
        assert!(tx.try_send(1).is_ok());
        assert!(tx.try_send(2).is_ok());
        assert_eq!(tx.try_send(3), Err(ChannelError::Full));

        assert_eq!(rx.try_recv(), Ok(1));
        assert_eq!(rx.try_recv(), Ok(2));
        assert_eq!(rx.try_recv(), Err(ChannelError::Empty));
    }

    #[test]
    fn test_close_drains_before_closed_error() {
        let (tx, rx) = bounded::<i32>(4);
        tx.send(1).unwrap();
        tx.send(2).unwrap();
        tx.close();

        assert_eq!(tx.send(3), Err(ChannelError::Closed));
        assert_eq!(rx.recv().unwrap(), 1);
        assert_eq!(rx.recv().unwrap(), 2);
        assert_eq!(rx.recv(), Err(ChannelError::Closed));
    }

    #[test]
    fn test_last_sender_drop_closes() {
        let (tx, rx) = bounded::<i32>(4);
        let tx2 = tx.clone();
        tx.send(1).unwrap();
        drop(tx);
        assert!(!rx.is_closed());
        drop(tx2);
        assert!(rx.is_closed());

        assert_eq!(rx.recv().unwrap(), 1);
        assert_eq!(rx.recv(), Err(ChannelError::Closed));
    }

    #[test]
    fn test_send_to_dropped_receivers_disconnects() {
        let (tx, rx) = bounded::<i32>(4);
        drop(rx);
        assert_eq!(tx.send(1), Err(ChannelError::Disconnected));
        assert_eq!(tx.try_send(1), Err(ChannelError::Disconnected));
    }

    #[test]
    fn test_rendezvous_handoff() {
        let (tx, rx) = rendezvous::<i32>();

        let sender = thread::spawn(move || {
            tx.send(42).unwrap();
            tx.send(43).unwrap();
        });

        thread::sleep(Duration::from_millis(10));
        assert_eq!(rx.recv().unwrap(), 42);
        assert_eq!(rx.recv().unwrap(), 43);
        sender.join().unwrap();
    }

    #[test]
    fn test_rendezvous_never_buffers() {
        let (tx, rx) = rendezvous::<i32>();
        assert_eq!(rx.len(), 0);
        assert_eq!(tx.try_send(1), Err(ChannelError::Full));

        let sender = thread::spawn(move || tx.send(9));
        thread::sleep(Duration::from_millis(10));
        assert_eq!(rx.len(), 0);
        assert_eq!(rx.recv().unwrap(), 9);
        sender.join().unwrap().unwrap();
    }

    #[test]
    fn test_rendezvous_try_send_with_parked_receiver() {
        let (tx, rx) = rendezvous::<i32>();

        let receiver = thread::spawn(move || rx.recv().unwrap());
        // Give the receiver time to park.
        thread::sleep(Duration::from_millis(20));
        assert!(tx.try_send(7).is_ok());
        assert_eq!(receiver.join().unwrap(), 7);
    }

    #[test]
    fn test_multiple_senders_each_fifo() {
        let (tx1, rx) = unbounded::<(u8, u32)>();
        let tx2 = tx1.clone();

        let a = thread::spawn(move || {
            for i in 0..100 {
                tx1.send((1, i)).unwrap();
            }
        });
        let b = thread::spawn(move || {
            for i in 0..100 {
                tx2.send((2, i)).unwrap();
            }
        });
        a.join().unwrap();
        b.join().unwrap();

        let mut last = [None::<u32>, None];
        for _ in 0..200 {
            let (who, i) = rx.recv().unwrap();
            let slot = &mut last[usize::from(who) - 1];
            if let Some(prev) = *slot {
                assert!(i > prev, "per-sender order violated");
            }
            *slot = Some(i);
        }
    }

    #[test]
    fn test_receiver_iterator_ends_on_close() {
        let (tx, rx) = bounded::<i32>(8);
        tx.send(1).unwrap();
        tx.send(2).unwrap();
        tx.send(3).unwrap();
        tx.close();

        let values: Vec<i32> = rx.into_iter().collect();
        assert_eq!(values, vec![1, 2, 3]);
    }

    #[test]
    fn test_blocked_send_wakes_on_recv() {
        let (tx, rx) = bounded::<i32>(1);
        tx.send(1).unwrap();

        let sender = thread::spawn(move || tx.send(2));
        thread::sleep(Duration::from_millis(10));
        assert_eq!(rx.recv().unwrap(), 1);
        sender.join().unwrap().unwrap();
        assert_eq!(rx.recv().unwrap(), 2);
    }

    #[test]
    fn test_cancelled_token_blocks_entry() {
        let (tx, rx) = bounded::<i32>(1);
        let token = CancelToken::new();
        token.cancel();

        with_current_token(&token, || {
            assert_eq!(tx.send(1), Err(ChannelError::Cancelled));
            assert_eq!(rx.recv(), Err(ChannelError::Cancelled));
        });
    }

    #[test]
    fn test_cancel_wakes_parked_receiver() {
        let (tx, rx) = bounded::<i32>(1);
        let rx_keepalive = rx.clone();
        let token = CancelToken::new();
        let waiter_token = token.clone();

        let waiter = thread::spawn(move || {
            with_current_token(&waiter_token, || rx.recv())
        });

        thread::sleep(Duration::from_millis(20));
        token.cancel();
        assert_eq!(waiter.join().unwrap(), Err(ChannelError::Cancelled));
        // The channel itself is unaffected.
        assert!(tx.try_send(5).is_ok());
        assert_eq!(rx_keepalive.recv(), Ok(5));
    }

    #[test]
    fn test_cancel_wakes_parked_sender() {
        let (tx, _rx) = bounded::<i32>(1);
        tx.send(1).unwrap();
        let token = CancelToken::new();
        let waiter_token = token.clone();

        let waiter = thread::spawn(move || {
            with_current_token(&waiter_token, || tx.send(2))
        });

        thread::sleep(Duration::from_millis(20));
        token.cancel();
        assert_eq!(waiter.join().unwrap(), Err(ChannelError::Cancelled));
    }
}
