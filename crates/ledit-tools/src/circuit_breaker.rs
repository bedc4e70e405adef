// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Per-invocation circuit breaker.
//!
//! Keys on `(tool_name, hash(arguments))` to catch the tight loop failure
//! mode where a model re-issues the same call over and over.  Distinct
//! arguments are distinct keys, so legitimate bulk work (say, reading many
//! files) is never throttled.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};
use tracing::warn;

/// Whether an invocation may proceed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BreakerDecision {
    Allow,
    /// The call is suppressed; `count` is how many identical invocations
    /// landed inside the current window.
    Suppress { count: u32 },
}

#[derive(Debug)]
struct ActionRecord {
    count: u32,
    window_start: Instant,
    last_time: Instant,
    blocked_until: Option<Instant>,
}

pub struct CircuitBreaker {
    threshold: u32,
    window: Duration,
    actions: Mutex<HashMap<String, ActionRecord>>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, window: Duration) -> Self {
        Self {
            threshold,
            window,
            actions: Mutex::new(HashMap::new()),
        }
    }

    /// Record one invocation of `(tool, arguments)` and decide whether it
    /// may run.  The first `threshold` identical calls inside a window are
    /// allowed; the next is suppressed and the key stays blocked until the
    /// window expires.
    pub fn check(&self, tool: &str, arguments_json: &str) -> BreakerDecision {
        let key = format!("{tool}:{}", stable_hash(arguments_json));
        let now = Instant::now();
        let mut actions = self.actions.lock().unwrap();
        let rec = actions.entry(key).or_insert(ActionRecord {
            count: 0,
            window_start: now,
            last_time: now,
            blocked_until: None,
        });

        if let Some(until) = rec.blocked_until {
            if now < until {
                rec.count += 1;
                rec.last_time = now;
                return BreakerDecision::Suppress { count: rec.count };
            }
            rec.blocked_until = None;
            rec.count = 0;
            rec.window_start = now;
        }

        // The window expires when it has run its full length, or when the
        // call pattern went quiet for a whole window; a tight loop does
        // neither.
        if now.duration_since(rec.window_start) > self.window
            || now.duration_since(rec.last_time) > self.window
        {
            rec.count = 0;
            rec.window_start = now;
        }

        rec.count += 1;
        rec.last_time = now;
        if rec.count > self.threshold {
            rec.blocked_until = Some(now + self.window);
            warn!(
                tool,
                count = rec.count,
                window_secs = self.window.as_secs(),
                "circuit breaker tripped for repeated identical invocation"
            );
            BreakerDecision::Suppress { count: rec.count }
        } else {
            BreakerDecision::Allow
        }
    }

    /// Forget all history.  Called at the start of each fresh query.
    pub fn reset(&self) {
        self.actions.lock().unwrap().clear();
    }

    /// Text returned to the model in place of a suppressed execution.
    pub fn suppression_message(tool: &str, count: u32) -> String {
        format!(
            "Tool call suppressed: {tool} has been invoked {count} times with identical \
             arguments in a short window. The repeated call is not executed. \
             Re-examine the previous results and try a different approach."
        )
    }
}

fn stable_hash(arguments_json: &str) -> String {
    // Hash the trimmed argument text; the same logical call produces the
    // same key across iterations and retries.
    let digest = Sha256::digest(arguments_json.trim().as_bytes());
    format!("{digest:x}")
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(5, Duration::from_secs(60))
    }

    #[test]
    fn first_five_identical_calls_allowed_sixth_suppressed() {
        let cb = breaker();
        for i in 1..=5 {
            assert_eq!(
                cb.check("read_file", r#"{"path":"a.rs"}"#),
                BreakerDecision::Allow,
                "call {i} should be allowed"
            );
        }
        assert!(matches!(
            cb.check("read_file", r#"{"path":"a.rs"}"#),
            BreakerDecision::Suppress { count: 6 }
        ));
    }

    #[test]
    fn different_arguments_do_not_share_a_key() {
        let cb = breaker();
        for i in 0..20 {
            let args = format!(r#"{{"path":"file_{i}.rs"}}"#);
            assert_eq!(cb.check("read_file", &args), BreakerDecision::Allow);
        }
    }

    #[test]
    fn different_tools_do_not_share_a_key() {
        let cb = breaker();
        for _ in 0..5 {
            cb.check("read_file", "{}");
        }
        assert_eq!(cb.check("list_dir", "{}"), BreakerDecision::Allow);
    }

    #[test]
    fn whitespace_in_arguments_does_not_change_the_key() {
        let cb = breaker();
        for _ in 0..5 {
            cb.check("shell_command", r#"{"command":"ls"}"#);
        }
        assert!(matches!(
            cb.check("shell_command", r#"  {"command":"ls"}  "#),
            BreakerDecision::Suppress { .. }
        ));
    }

    #[test]
    fn reset_clears_history() {
        let cb = breaker();
        for _ in 0..6 {
            cb.check("read_file", "{}");
        }
        cb.reset();
        assert_eq!(cb.check("read_file", "{}"), BreakerDecision::Allow);
    }

    #[test]
    fn window_expiry_reopens_the_key() {
        let cb = CircuitBreaker::new(2, Duration::from_millis(20));
        cb.check("t", "{}");
        cb.check("t", "{}");
        assert!(matches!(cb.check("t", "{}"), BreakerDecision::Suppress { .. }));
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(cb.check("t", "{}"), BreakerDecision::Allow);
    }

    #[test]
    fn suppression_message_names_tool_and_count() {
        let msg = CircuitBreaker::suppression_message("read_file", 6);
        assert!(msg.contains("read_file"));
        assert!(msg.contains('6'));
        assert!(msg.to_lowercase().contains("different approach"));
    }
}
