//! [`Backoff`] – bounded exponential retry for blocking hardware reads.
//!
//! Attempt `k` (zero-based) is preceded by a sleep of `base · 2^(k-1)`,
//! capped at `max_delay`.  The first attempt runs immediately.
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//! use patrol_runtime::retry::Backoff;
//!
//! let backoff = Backoff::new(3, Duration::from_millis(1));
//! let mut calls = 0;
//! let value = backoff.run("pir_front", || {
//!     calls += 1;
//!     if calls < 3 { Err("bus busy") } else { Ok(42) }
//! });
//! assert_eq!(value, Ok(42));
//! ```

use std::fmt::Display;
use std::time::Duration;

use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    attempts: u32,
    base: Duration,
    max_delay: Duration,
}

impl Backoff {
    /// `attempts` total tries (at least one), first retry after `base`.
    pub fn new(attempts: u32, base: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            base,
            max_delay: Duration::from_secs(5),
        }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Sleep preceding attempt `attempt` (zero-based).
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max_delay)
    }

    /// Run `op` until it succeeds or the attempts are exhausted, sleeping the
    /// current thread between tries.  Returns the last error on exhaustion.
    pub fn run<T, E, F>(&self, what: &str, mut op: F) -> Result<T, E>
    where
        E: Display,
        F: FnMut() -> Result<T, E>,
    {
        let mut attempt = 0;
        loop {
            std::thread::sleep(self.delay_before(attempt));
            match op() {
                Ok(value) => {
                    if attempt > 0 {
                        debug!(what, attempts = attempt + 1, "succeeded after retries");
                    }
                    return Ok(value);
                }
                Err(e) if attempt + 1 < self.attempts => {
                    debug!(what, attempt = attempt + 1, error = %e, "attempt failed; retrying");
                    attempt += 1;
                }
                Err(e) => {
                    warn!(what, attempts = self.attempts, error = %e, "retries exhausted");
                    return Err(e);
                }
            }
        }
    }
}
