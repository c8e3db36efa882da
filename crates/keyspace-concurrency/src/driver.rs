//! The transaction driver (§4.E): retries a unit of work against
//! transient conflicts with exponential backoff and jitter, and leaves
//! every other error to the caller.
//!
//! ```
//! use keyspace_concurrency::{RetryConfig, TransactionDriver};
//! use keyspace_storage::{KvStore, MemoryStore};
//!
//! let store = MemoryStore::new();
//! let driver = TransactionDriver::new(RetryConfig::default());
//! let result = driver.run(&store, |tx| {
//!     tx.set(b"k", b"v".to_vec());
//!     Ok(())
//! });
//! assert!(result.is_ok());
//! ```

use std::thread::sleep;
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{debug, warn};

use keyspace_core::{Error, Result};
use keyspace_storage::{KvStore, Transaction};

/// Relative scheduling priority passed through to the underlying store.
/// The in-memory backend does not differentiate; a real FoundationDB
/// client would map this to `TransactionOption::PRIORITY_*`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Priority {
    #[default]
    Default,
    Batch,
    Immediate,
}

/// Retry policy for [`TransactionDriver::run`].
#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    pub retry_limit: usize,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub timeout: Option<Duration>,
    pub priority: Priority,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            retry_limit: 5,
            initial_delay: Duration::from_millis(300),
            max_delay: Duration::from_millis(1000),
            timeout: Some(Duration::from_secs(5)),
            priority: Priority::Default,
        }
    }
}

/// Runs a unit of work against a [`KvStore`], retrying on
/// [`Error::is_retryable`] conflicts until `retry_limit` or `timeout` is
/// exhausted.
pub struct TransactionDriver {
    config: RetryConfig,
}

impl TransactionDriver {
    pub fn new(config: RetryConfig) -> Self {
        TransactionDriver { config }
    }

    /// Run `body` once per attempt against a fresh transaction. `body`
    /// must be idempotent with respect to any side effects outside the
    /// transaction itself, since a conflicting attempt is discarded and
    /// retried from scratch.
    pub fn run<T>(
        &self,
        store: &dyn KvStore,
        body: impl FnMut(&dyn Transaction) -> Result<T>,
    ) -> Result<T> {
        self.run_with_read_version(store, None, body)
    }

    /// Like [`TransactionDriver::run`], but pins every attempt's transaction
    /// to `read_version` instead of letting the store pick the latest one.
    /// Used by readers that need a stable snapshot across a cache's TTL
    /// (§4.D's read-version cache).
    pub fn run_with_read_version<T>(
        &self,
        store: &dyn KvStore,
        read_version: Option<u64>,
        mut body: impl FnMut(&dyn Transaction) -> Result<T>,
    ) -> Result<T> {
        let started_at = Instant::now();
        let mut attempt = 0usize;
        loop {
            if let Some(timeout) = self.config.timeout {
                if started_at.elapsed() >= timeout {
                    return Err(Error::Timeout(timeout));
                }
            }

            let txn = store.begin(read_version);
            match body(txn.as_ref()).and_then(|value| txn.commit().map(|_| value)) {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt < self.config.retry_limit => {
                    let delay = self.backoff_delay(attempt);
                    warn!(attempt, ?delay, error = %err, "retrying transaction after conflict");
                    sleep(delay);
                    attempt += 1;
                }
                Err(err) => {
                    debug!(attempt, error = %err, "transaction failed without retry");
                    return Err(err);
                }
            }
        }
    }

    fn backoff_delay(&self, attempt: usize) -> Duration {
        let exp = self.config.initial_delay.as_millis() as u64 * (1u64 << attempt.min(20));
        let capped = exp.min(self.config.max_delay.as_millis() as u64);
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        Duration::from_millis(((capped as f64) * jitter) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keyspace_storage::MemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn successful_body_commits_on_first_attempt() {
        let store = MemoryStore::new();
        let driver = TransactionDriver::new(RetryConfig::default());
        let result = driver.run(&store, |tx| {
            tx.set(b"a", b"1".to_vec());
            Ok::<_, Error>(())
        });
        assert!(result.is_ok());
    }

    #[test]
    fn non_retryable_error_is_returned_immediately() {
        let store = MemoryStore::new();
        let driver = TransactionDriver::new(RetryConfig::default());
        let attempts = AtomicUsize::new(0);
        let result: Result<()> = driver.run(&store, |_tx| {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(Error::InvalidArgument("bad input".into()))
        });
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn conflicting_transaction_is_retried_until_it_commits() {
        let store = MemoryStore::new();
        let driver = TransactionDriver::new(RetryConfig {
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            ..RetryConfig::default()
        });

        // Pre-seed a key, then force one read-write conflict by committing
        // a racing write between this driver's first and second attempt.
        let seed = store.begin(None);
        seed.set(b"counter", 0i64.to_le_bytes().to_vec());
        seed.commit().unwrap();

        let attempts = AtomicUsize::new(0);
        let result = driver.run(&store, |tx| {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            if n == 0 {
                // Simulate a concurrent writer racing this transaction.
                let racer = store.begin(None);
                racer.set(b"counter", 99i64.to_le_bytes().to_vec());
                racer.commit().unwrap();
            }
            let _ = tx.get(b"counter")?;
            tx.set(b"counter", 1i64.to_le_bytes().to_vec());
            Ok::<_, Error>(())
        });

        assert!(result.is_ok());
        assert!(attempts.load(Ordering::SeqCst) >= 2);
    }

    #[test]
    fn retry_limit_exhausted_surfaces_conflict() {
        let store = MemoryStore::new();
        let driver = TransactionDriver::new(RetryConfig {
            retry_limit: 0,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
            timeout: None,
            priority: Priority::Default,
        });

        let seed = store.begin(None);
        seed.set(b"k", b"v".to_vec());
        seed.commit().unwrap();

        let result: Result<()> = driver.run(&store, |tx| {
            let _ = tx.get(b"k")?;
            let racer = store.begin(None);
            racer.set(b"k", b"w".to_vec());
            racer.commit().unwrap();
            tx.set(b"k", b"x".to_vec());
            Ok(())
        });
        assert!(result.is_err());
    }
}
