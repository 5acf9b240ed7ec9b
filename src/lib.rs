//! # Strand
//!
//! A structured-concurrency runtime core: a work-stealing task scheduler,
//! scope-based task lifetimes with cooperative cancellation and error
//! propagation, and a channel/select communication layer.
//!
//! This library is the execution substrate for a surrounding system (a
//! language runtime or application host). It schedules one-shot closures on
//! a pooled arena of OS worker threads and guarantees that no task outlives
//! the scope that spawned it.
//!
//! ## Core Model
//!
//! - **Tasks are cheap, workers are pooled**: a task is a queued closure, not
//!   an OS thread. Workers are created once and reused; spawning never
//!   creates a thread.
//! - **Structured lifetimes**: tasks are spawned inside a [`core::Scope`] or
//!   [`core::SupervisorScope`] and are always joined (or cancelled and then
//!   joined) before the scope exits, on every exit path.
//! - **Cooperative cancellation**: a [`core::CancelToken`] is an advisory
//!   flag. A cancelled task stops at its next checkpoint - an explicit
//!   `check()`, entry to a blocking channel operation, or completion. Running
//!   code is never forcibly terminated.
//! - **Channels are the communication path**: typed rendezvous, bounded, and
//!   unbounded [`channel`]s with blocking and non-blocking operations, plus a
//!   fair [`channel::Select`] over multiple operations.
//!
//! ## Scheduling
//!
//! The [`sched::Scheduler`] keeps a global injector queue plus one local
//! deque per worker. Idle workers pop locally, periodically poll the
//! injector so externally-submitted work cannot starve, then steal half of a
//! random peer's deque, and finally park until new work is pushed. See the
//! module docs for the exact policy.
//!
//! ## Example
//!
//! ```rust,ignore
//! use strand::core::scoped_failfast;
//!
//! let result = scoped_failfast(|scope| {
//!     let a = scope.spawn(|| 1 + 1).unwrap();
//!     let b = scope.spawn(|| 2 + 2).unwrap();
//!     a.join().unwrap() + b.join().unwrap()
//! });
//! assert_eq!(result.unwrap(), 6);
//! ```
//!
//! ## Integration Seams
//!
//! The host supplies time and I/O readiness through the [`driver`] traits;
//! the core only registers deadlines/interest and consumes wake-ups. No
//! on-disk format or network protocol is defined here; this is an in-process
//! library boundary only.

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Task, scope, and cancellation primitives.
pub mod core;
/// Typed channels and the select multiplexer.
pub mod channel;
/// Scheduler configuration models.
pub mod config;
/// Timer and I/O driver seams supplied by the host.
pub mod driver;
/// The work-stealing scheduler and its worker arena.
pub mod sched;
/// Shared utilities.
pub mod util;
