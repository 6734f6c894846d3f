//! Bounded retry with a fixed pause between attempts

use crate::types::{MosaicError, MosaicResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Retry settings for one class of network operation
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    /// Pause between attempts
    pub pause: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, pause: Duration) -> Self {
        Self { max_attempts, pause }
    }

    /// Pixel loads: 15 attempts, 10 s apart
    pub fn pixel_load() -> Self {
        Self::new(15, Duration::from_secs(10))
    }

    pub fn catalog_search() -> Self {
        Self::new(3, Duration::from_secs(2))
    }

    pub fn metadata_fetch() -> Self {
        Self::new(2, Duration::from_secs(1))
    }

    /// Single attempt, no pause
    pub fn none() -> Self {
        Self::new(1, Duration::ZERO)
    }

    /// Run `op` until it succeeds, fails with a non-transient error, or the
    /// attempt budget is spent. The last error is returned on exhaustion.
    pub fn run<T, F>(&self, label: &str, mut op: F) -> MosaicResult<T>
    where
        F: FnMut() -> MosaicResult<T>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=max_attempts {
            match op() {
                Ok(value) => {
                    if attempt > 1 {
                        log::debug!("{} succeeded on attempt {}", label, attempt);
                    }
                    return Ok(value);
                }
                Err(e) if e.is_transient() => {
                    log::warn!(
                        "{}: transient failure ({}), attempt {}/{}",
                        label, e, attempt, max_attempts
                    );
                    last_error = Some(e);
                    if attempt < max_attempts && !self.pause.is_zero() {
                        std::thread::sleep(self.pause);
                    }
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or_else(|| {
            MosaicError::Processing(format!("{} failed after all retries", label))
        }))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_retries_transient_until_success() {
        let calls = Cell::new(0);
        let policy = RetryPolicy::new(5, Duration::ZERO);
        let result = policy.run("flaky", || {
            calls.set(calls.get() + 1);
            if calls.get() < 3 {
                Err(MosaicError::Transient("reset".into()))
            } else {
                Ok(42)
            }
        });
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn test_exhaustion_returns_last_error() {
        let calls = Cell::new(0);
        let policy = RetryPolicy::new(4, Duration::ZERO);
        let result: MosaicResult<()> = policy.run("down", || {
            calls.set(calls.get() + 1);
            Err(MosaicError::Transient(format!("timeout {}", calls.get())))
        });
        assert_eq!(calls.get(), 4);
        match result {
            Err(MosaicError::Transient(msg)) => assert_eq!(msg, "timeout 4"),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_non_transient_is_not_retried() {
        let calls = Cell::new(0);
        let policy = RetryPolicy::new(10, Duration::ZERO);
        let result: MosaicResult<()> = policy.run("bad request", || {
            calls.set(calls.get() + 1);
            Err(MosaicError::Http("400 Bad Request".into()))
        });
        assert!(matches!(result, Err(MosaicError::Http(_))));
        assert_eq!(calls.get(), 1);
    }
}
