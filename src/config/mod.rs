//! Configuration models for the scheduler.

pub mod sched;

pub use sched::SchedulerConfig;
