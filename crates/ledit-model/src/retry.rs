// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Backoff schedules for the streaming client.
//!
//! Transient transport errors use an exponential schedule with jitter.
//! Rate-limit events run on a separate, flatter schedule with independent
//! attempt accounting so a burst of 429s is visible as such in the final
//! error rather than being folded into generic transport retries.

use std::time::Duration;

use rand::Rng;

/// Configuration for the transient-error backoff schedule.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Retries after the initial attempt.
    pub max_retries: u32,
    /// Base delay in milliseconds; doubles each attempt.
    pub base_delay_ms: u64,
    /// Cap applied after the exponential step.
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1000,
            max_delay_ms: 16_000,
        }
    }
}

impl RetryConfig {
    /// Delay before retry `attempt` (0-based): `base * 2^attempt`, capped,
    /// plus uniform jitter of up to half the capped value.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay_ms
            .saturating_mul(2u64.saturating_pow(attempt));
        let capped = exp.min(self.max_delay_ms);
        let jitter = if capped == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=capped / 2)
        };
        Duration::from_millis(capped + jitter)
    }

    /// Deterministic lower bound of [`delay_for`], used by tests.
    pub fn base_delay_for(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay_ms
            .saturating_mul(2u64.saturating_pow(attempt));
        Duration::from_millis(exp.min(self.max_delay_ms))
    }
}

/// Sliding record of rate-limit events for one `(provider, model)` pair.
#[derive(Debug, Clone, Default)]
pub struct RateLimitState {
    pub attempt_count: u32,
    pub last_retry_after: Option<Duration>,
    pub cumulative_backoff: Duration,
}

impl RateLimitState {
    /// Record one rate-limit event and return the delay to wait before the
    /// next attempt.
    ///
    /// The provider's `retry-after` hint wins when present; otherwise a
    /// linear schedule (5s, 10s, 15s, … capped at 60s) applies.  Linear
    /// rather than exponential: quota windows reset on wall-clock
    /// boundaries, so doubling overshoots the reset point.
    pub fn record(&mut self, retry_after: Option<Duration>) -> Duration {
        self.attempt_count += 1;
        self.last_retry_after = retry_after;
        let delay = retry_after.unwrap_or_else(|| {
            Duration::from_secs((5 * self.attempt_count as u64).min(60))
        });
        self.cumulative_backoff += delay;
        delay
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
