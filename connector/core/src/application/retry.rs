// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Retry Policy
//!
//! Maps a consecutive-failure count to a retry/no-retry decision and a
//! backoff delay. Delays grow exponentially and are strictly monotonic up to
//! the cap, so the `state_timestamp` of a retried entity always moves
//! forward between attempts.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_retries: u32,
    base_delay: Duration,
    cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 7,
            base_delay: Duration::from_secs(1),
            cap: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration, cap: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            cap,
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// True once `state_count` has exceeded the allowed retries; the caller
    /// escalates to termination.
    pub fn exhausted(&self, state_count: u32) -> bool {
        state_count > self.max_retries
    }

    /// Backoff before attempt `state_count + 1`. `state_count` is 1-based:
    /// the first failure waits `base_delay`, each further failure doubles it.
    pub fn delay(&self, state_count: u32) -> Duration {
        let exponent = state_count.saturating_sub(1).min(16);
        let delay = self
            .base_delay
            .saturating_mul(1u32.checked_shl(exponent).unwrap_or(u32::MAX));
        delay.min(self.cap)
    }
}
