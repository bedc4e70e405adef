// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Error taxonomy for the streaming client.
//!
//! Errors are classified by effect, not by library type: what matters to the
//! retry loop and to the orchestrator's surfacing rules is whether a failure
//! is transient, quota-related, protocol-level, or a local timeout.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    /// Transient transport failure (stream error, reset, EOF).  Retryable.
    #[error("transport error: {0}")]
    Transport(String),

    /// The provider signalled a rate limit for this attempt.
    #[error("rate limited{}", retry_after.map(|d| format!(" (retry after {}s)", d.as_secs())).unwrap_or_default())]
    RateLimited { retry_after: Option<Duration> },

    /// Every retryable attempt was exhausted on rate limits.
    #[error("rate limit exceeded after {attempts} attempts: {last_error}")]
    RateLimitExceeded { attempts: u32, last_error: String },

    /// 502 / upstream bad-state.  Deliberately not retried.
    #[error("upstream error: {0}")]
    Upstream(String),

    /// 401 / bad API key.  Surfaced with remediation guidance.
    #[error("authentication failed: {0}. Check your API key configuration (api_key_env in ~/.ledit/config.yaml)")]
    Auth(String),

    /// The requested model does not exist at this provider.
    #[error("model not found: {0}. Switch models with --model <provider>/<name>")]
    ModelNotFound(String),

    /// One of the four client timeout budgets fired.
    #[error("{budget} timeout: {detail}")]
    Timeout { budget: TimeoutBudget, detail: String },

    /// The provider refused the content.
    #[error("response blocked by provider content filter")]
    ContentFiltered,

    /// The per-query cancellation context fired.
    #[error("request cancelled")]
    Cancelled,
}

/// Which of the layered timeout budgets was exceeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutBudget {
    Connect,
    FirstChunk,
    Chunk,
    Overall,
}

impl std::fmt::Display for TimeoutBudget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connect => write!(f, "connection"),
            Self::FirstChunk => write!(f, "first-chunk"),
            Self::Chunk => write!(f, "chunk"),
            Self::Overall => write!(f, "overall"),
        }
    }
}

impl ApiError {
    /// True when the retry loop should attempt the request again.
    ///
    /// Timeouts are typed locally and not retried: a budget that fired once
    /// will fire again, and the user is better served by a prompt error than
    /// by multiplied waiting.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_))
    }

    pub fn is_rate_limit(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }
}

/// Classify a raw provider/transport error string into an [`ApiError`].
///
/// Substring rules, in precedence order:
/// 1. auth (401 / unauthorized / api key),
/// 2. model-not-found ("model" co-occurring with not-exist markers),
/// 3. rate limit (429 / rate limit / too many requests),
/// 4. upstream ("502" / "upstream error") — checked before the transient
///    rules so a "502 stream error" is not retried,
/// 5. transient transport (stream error / INTERNAL_ERROR / connection
///    reset / EOF / timeout).
///
/// Anything unrecognized is treated as non-retryable transport-level detail
/// wrapped in [`ApiError::Upstream`] so it surfaces immediately.
pub fn classify(raw: &str) -> ApiError {
    let lower = raw.to_lowercase();

    if lower.contains("401") || lower.contains("unauthorized") || lower.contains("api key") {
        return ApiError::Auth(raw.to_string());
    }

    if lower.contains("model")
        && (lower.contains("not exist") || lower.contains("not found") || lower.contains("invalid"))
    {
        return ApiError::ModelNotFound(raw.to_string());
    }

    if lower.contains("429")
        || lower.contains("rate limit")
        || lower.contains("too many requests")
    {
        return ApiError::RateLimited {
            retry_after: parse_retry_after(&lower),
        };
    }

    if lower.contains("502") || lower.contains("upstream error") {
        return ApiError::Upstream(raw.to_string());
    }

    let transient = ["stream error", "internal_error", "connection reset", "eof", "timeout", "timed out"];
    if transient.iter().any(|t| lower.contains(t)) {
        return ApiError::Transport(raw.to_string());
    }

    ApiError::Upstream(raw.to_string())
}

/// Best-effort extraction of a `retry-after: <seconds>` hint from an error
/// body.  Providers embed it in several spellings; only the numeric-seconds
/// form is recognized.
fn parse_retry_after(lower: &str) -> Option<Duration> {
    let idx = lower.find("retry-after")?;
    let tail = &lower[idx + "retry-after".len()..];
    let digits: String = tail
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse::<u64>().ok().map(Duration::from_secs)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
