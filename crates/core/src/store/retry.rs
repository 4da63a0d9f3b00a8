//! Bounded retry for database contention.
//!
//! Several daemons share one SQLite file. A writer that finds the database
//! locked waits a fixed interval and tries again; only an operator-visible
//! number of consecutive failures turns into an error.
//!
//! Store calls are synchronous and are made from async tasks. On a
//! multi-threaded runtime the wait goes through `block_in_place`, so tasks
//! queued on the same worker (downloads in flight) move to another thread
//! instead of stalling behind the lock.

use std::time::Duration;

use tokio::runtime::{Handle, RuntimeFlavor};
use tracing::warn;

use super::StoreError;
use crate::config::DatabaseConfig;
use crate::metrics;

/// How contention on the store is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Pause between attempts.
    pub interval: Duration,
    /// Attempts after which every further retry is logged as a warning.
    pub warn_after: u32,
    /// Attempts after which [`StoreError::Busy`] is returned.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&DatabaseConfig::default())
    }
}

impl From<&DatabaseConfig> for RetryPolicy {
    fn from(config: &DatabaseConfig) -> Self {
        Self {
            interval: Duration::from_millis(config.busy_retry_interval_ms),
            warn_after: config.busy_warn_after,
            max_attempts: config.busy_max_retries.max(1),
        }
    }
}

impl RetryPolicy {
    /// Run `op` until it succeeds, fails with a non-contention error, or the
    /// attempt budget runs out.
    pub fn run<T, F>(&self, mut op: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Result<T, StoreError>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op() {
                Err(e) if e.is_contention() => {
                    metrics::STORE_BUSY_RETRIES.inc();
                    if attempt >= self.max_attempts {
                        return Err(StoreError::Busy { attempts: attempt });
                    }
                    if attempt >= self.warn_after {
                        warn!("Database busy, retry {} of {}: {}", attempt, self.max_attempts, e);
                    }
                    pause(self.interval);
                }
                other => return other,
            }
        }
    }
}

fn pause(interval: Duration) {
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(|| std::thread::sleep(interval))
        }
        _ => std::thread::sleep(interval),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn busy() -> StoreError {
        StoreError::Sqlite(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        ))
    }

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            interval: Duration::from_millis(1),
            warn_after: 2,
            max_attempts,
        }
    }

    #[test]
    fn test_retries_until_success() {
        let mut calls = 0;
        let result = fast_policy(10).run(|| {
            calls += 1;
            if calls < 4 {
                Err(busy())
            } else {
                Ok(calls)
            }
        });
        assert_eq!(result.unwrap(), 4);
    }

    #[test]
    fn test_gives_up_after_budget() {
        let mut calls = 0;
        let result: Result<(), _> = fast_policy(3).run(|| {
            calls += 1;
            Err(busy())
        });
        assert!(matches!(result, Err(StoreError::Busy { attempts: 3 })));
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_other_errors_are_not_retried() {
        let mut calls = 0;
        let result: Result<(), _> = fast_policy(10).run(|| {
            calls += 1;
            Err(StoreError::Conflict("duplicate".to_string()))
        });
        assert!(matches!(result, Err(StoreError::Conflict(_))));
        assert_eq!(calls, 1);
    }
}
