// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Reconnection backoff.
//!
//! - [`BackoffPolicy`]: exponential growth parameters, capped
//! - [`Backoff`]: per-runner bookkeeping (consecutive failures, reset on a
//!   sustained session)
//!
//! Delays are not jittered and not coordinated across replicas.
//!
//! # Example
//!
//! ```rust
//! use broadcast_bus::resilience::{Backoff, BackoffPolicy};
//! use std::time::Duration;
//!
//! let mut backoff = Backoff::new(BackoffPolicy::default());
//! assert_eq!(backoff.next_delay(), Duration::from_secs(1));
//! assert_eq!(backoff.next_delay(), Duration::from_secs(2));
//!
//! // A long healthy session starts the schedule over
//! backoff.record_session(Duration::from_secs(120));
//! assert_eq!(backoff.next_delay(), Duration::from_secs(1));
//! ```

use std::time::Duration;

/// Exponential backoff parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// Delay after the first failure.
    pub initial_delay: Duration,

    /// Maximum delay between attempts (ceiling for exponential backoff).
    pub max_delay: Duration,

    /// Backoff multiplier (e.g., 2.0 = double delay each failure).
    pub growth_factor: f64,

    /// A session that lasted at least this long resets the failure count.
    pub reset_after: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            growth_factor: 2.0,
            reset_after: Duration::from_secs(60),
        }
    }
}

impl BackoffPolicy {
    /// Long-running daemon schedule.
    ///
    /// # Backoff Schedule
    ///
    /// ```text
    /// Failures  Delay
    /// --------  -----
    /// 0         1s
    /// 1         2s
    /// 2         4s
    /// 3         8s
    /// 4         16s
    /// 5         32s
    /// 6+        60s (cap)
    /// ```
    pub fn daemon() -> Self {
        Self::default()
    }

    /// Fast schedule for tests.
    pub fn testing() -> Self {
        Self {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            growth_factor: 2.0,
            reset_after: Duration::from_millis(500),
        }
    }

    /// Delay after `failures` prior consecutive failures:
    /// `min(initial * growth^failures, max)`.
    pub fn delay_for_failures(&self, failures: u32) -> Duration {
        let exponent = i32::try_from(failures).unwrap_or(i32::MAX);
        let multiplier = self.growth_factor.powi(exponent);
        let delay_secs = self.initial_delay.as_secs_f64() * multiplier;

        // powi overflows to infinity long before the loop would care
        match Duration::try_from_secs_f64(delay_secs) {
            Ok(delay) => std::cmp::min(delay, self.max_delay),
            Err(_) => self.max_delay,
        }
    }
}

/// Backoff bookkeeping owned by one reconnection loop.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    failures: u32,
}

impl Backoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self { policy, failures: 0 }
    }

    /// Consecutive failures recorded since the last reset.
    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    /// Delay the next call to [`next_delay`](Self::next_delay) would return.
    pub fn peek_delay(&self) -> Duration {
        self.policy.delay_for_failures(self.failures)
    }

    /// Record a failed (or ended) session and return how long to wait.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.peek_delay();
        self.failures = self.failures.saturating_add(1);
        delay
    }

    /// Report how long the session that just ended was streaming.
    ///
    /// Returns `true` if it was long enough to reset the schedule.
    pub fn record_session(&mut self, streamed_for: Duration) -> bool {
        if streamed_for >= self.policy.reset_after {
            self.reset();
            true
        } else {
            false
        }
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }
}
