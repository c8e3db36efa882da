//! Process-wide configuration consumed by the container at construction.
//!
//! The env-var-driven configuration façade is an external collaborator
//! (§1, out of scope here): this module carries only the resolved
//! values — retry policy and codec limits — that the transaction driver
//! and record codec need, constructed as an immutable value rather than
//! a process-wide singleton (§9, Global configuration).

use std::time::Duration;

use keyspace_concurrency::{Priority, RetryConfig};
use keyspace_core::Limits;

/// Immutable, container-scoped configuration. Build one with
/// [`ContainerConfig::default`] or override individual fields with the
/// builder methods before passing it to [`crate::Container::new`].
#[derive(Debug, Clone, Copy)]
pub struct ContainerConfig {
    pub retry_limit: usize,
    pub initial_delay_ms: u64,
    pub max_retry_delay_ms: u64,
    pub default_timeout_ms: Option<u64>,
    pub limits: Limits,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        ContainerConfig {
            retry_limit: 5,
            initial_delay_ms: 300,
            max_retry_delay_ms: 1000,
            default_timeout_ms: Some(5_000),
            limits: Limits::default(),
        }
    }
}

impl ContainerConfig {
    pub fn with_retry_limit(mut self, retry_limit: usize) -> Self {
        self.retry_limit = retry_limit;
        self
    }

    pub fn with_limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }

    /// The [`RetryConfig`] the container hands to every driver-managed
    /// transaction it opens.
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            retry_limit: self.retry_limit,
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            max_delay: Duration::from_millis(self.max_retry_delay_ms),
            timeout: self.default_timeout_ms.map(Duration::from_millis),
            priority: Priority::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_process_wide_defaults() {
        let config = ContainerConfig::default();
        assert_eq!(config.retry_limit, 5);
        assert_eq!(config.initial_delay_ms, 300);
        assert_eq!(config.max_retry_delay_ms, 1000);
    }

    #[test]
    fn retry_config_translates_millisecond_fields_to_durations() {
        let config = ContainerConfig::default();
        let retry = config.retry_config();
        assert_eq!(retry.initial_delay, Duration::from_millis(300));
        assert_eq!(retry.max_delay, Duration::from_millis(1000));
        assert_eq!(retry.timeout, Some(Duration::from_secs(5)));
    }

    #[test]
    fn builder_overrides_retry_limit() {
        let config = ContainerConfig::default().with_retry_limit(10);
        assert_eq!(config.retry_config().retry_limit, 10);
    }
}
