//! Scheduler configuration structure.

use serde::{Deserialize, Serialize};

/// Configuration for a [`Scheduler`](crate::sched::Scheduler).
///
/// # Example
///
/// ```rust,ignore
/// let config = SchedulerConfig::new()
///     .with_worker_count(4)
///     .with_local_queue_capacity(128);
/// let scheduler = Scheduler::new(config)?;
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Number of worker threads. Defaults to the number of logical CPUs,
    /// with a floor of 2 so a task that blocks on work behind it can be
    /// rescued by a peer; `1` gives a strictly single-threaded scheduler.
    pub worker_count: usize,
    /// Soft bound on each worker's local deque. Pushes past the bound
    /// overflow to the global injector so local memory stays bounded.
    pub local_queue_capacity: usize,
    /// A worker polls the global injector with probability
    /// `1 / global_check_interval` even while it has local work, so
    /// externally-injected tasks cannot starve behind a busy local queue.
    /// A prime keeps workers from synchronizing on the injector.
    pub global_check_interval: u32,
    /// Name prefix for worker threads (`<prefix>-<index>`).
    pub thread_name_prefix: String,
    /// Stack size for worker threads, in bytes. `None` uses the platform
    /// default.
    pub thread_stack_size: Option<usize>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            worker_count: num_cpus::get().max(2),
            local_queue_capacity: 256,
            global_check_interval: 61,
            thread_name_prefix: "strand-worker".to_string(),
            thread_stack_size: None,
        }
    }
}

impl SchedulerConfig {
    /// Create a configuration with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of worker threads.
    #[must_use]
    pub fn with_worker_count(mut self, count: usize) -> Self {
        self.worker_count = count;
        self
    }

    /// Set the local queue soft bound.
    #[must_use]
    pub fn with_local_queue_capacity(mut self, capacity: usize) -> Self {
        self.local_queue_capacity = capacity;
        self
    }

    /// Set the inverse probability of the injector check.
    #[must_use]
    pub const fn with_global_check_interval(mut self, interval: u32) -> Self {
        self.global_check_interval = interval;
        self
    }

    /// Set the worker thread name prefix.
    #[must_use]
    pub fn with_thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = prefix.into();
        self
    }

    /// Set the worker thread stack size in bytes.
    #[must_use]
    pub const fn with_thread_stack_size(mut self, size: usize) -> Self {
        self.thread_stack_size = Some(size);
        self
    }

    /// Validate configuration values.
    ///
    /// # Errors
    ///
    /// Returns a description of the first invalid field.
    pub fn validate(&self) -> Result<(), String> {
        if self.worker_count == 0 {
            return Err("worker_count must be greater than 0".into());
        }
        if self.local_queue_capacity == 0 {
            return Err("local_queue_capacity must be greater than 0".into());
        }
        if self.global_check_interval < 2 {
            return Err("global_check_interval must be at least 2".into());
        }
        if self.thread_name_prefix.is_empty() {
            return Err("thread_name_prefix must not be empty".into());
        }
        Ok(())
    }

    /// Parse a configuration from a JSON string and validate it.
    ///
    /// # Errors
    ///
    /// Returns a parse or validation error description.
    pub fn from_json_str(input: &str) -> Result<Self, String> {
        let cfg: Self = serde_json::from_str(input).map_err(|e| format!("parse error: {e}"))?;
        cfg.validate()?;
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = SchedulerConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.worker_count >= 1);
        assert_eq!(config.local_queue_capacity, 256);
        assert_eq!(config.global_check_interval, 61);
    }

    #[test]
    fn test_builder_methods() {
        let config = SchedulerConfig::new()
            .with_worker_count(2)
            .with_local_queue_capacity(64)
            .with_global_check_interval(31)
            .with_thread_name_prefix("custom")
            .with_thread_stack_size(1024 * 1024);

        assert_eq!(config.worker_count, 2);
        assert_eq!(config.local_queue_capacity, 64);
        assert_eq!(config.global_check_interval, 31);
        assert_eq!(config.thread_name_prefix, "custom");
        assert_eq!(config.thread_stack_size, Some(1024 * 1024));
    }

    #[test]
    fn test_validate_rejects_zero_workers() {
        let config = SchedulerConfig::new().with_worker_count(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_json_str_partial() {
        let config = SchedulerConfig::from_json_str(r#"{"worker_count": 3}"#).unwrap();
        assert_eq!(config.worker_count, 3);
        assert_eq!(config.local_queue_capacity, 256);
    }

    #[test]
    fn test_from_json_str_invalid() {
        assert!(SchedulerConfig::from_json_str(r#"{"worker_count": 0}"#).is_err());
        assert!(SchedulerConfig::from_json_str("not json").is_err());
    }
}
