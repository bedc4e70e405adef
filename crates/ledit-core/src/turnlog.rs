// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Optional append-only turn log.
//!
//! When `LEDIT_TURN_LOG_FILE` is set, every orchestrator iteration appends
//! one JSON line describing what the model said, which tools ran, and how
//! the iteration ended.  Write failures are logged and swallowed; the log
//! is diagnostics, not state.

use std::io::Write;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::warn;

use ledit_model::Usage;

/// Per-iteration record of the orchestrator loop.
#[derive(Debug, Clone, Serialize)]
pub struct TurnEvaluation {
    pub iteration: u32,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_input: Option<String>,
    pub assistant_content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_snippet: Option<String>,
    pub tool_calls: Vec<String>,
    pub tool_results: Vec<String>,
    pub tool_logs: Vec<String>,
    pub finish_reason: String,
    pub token_usage: Usage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guardrail_trigger: Option<String>,
    pub completion_reached: bool,
}

impl TurnEvaluation {
    pub fn new(iteration: u32) -> Self {
        Self {
            iteration,
            timestamp: Utc::now(),
            user_input: None,
            assistant_content: String::new(),
            reasoning_snippet: None,
            tool_calls: Vec::new(),
            tool_results: Vec::new(),
            tool_logs: Vec::new(),
            finish_reason: String::new(),
            token_usage: Usage::default(),
            guardrail_trigger: None,
            completion_reached: false,
        }
    }
}

/// Appends [`TurnEvaluation`] records as JSONL to the configured sink.
pub struct TurnLogger {
    path: Option<PathBuf>,
}

impl TurnLogger {
    /// Build from the environment toggle.
    pub fn from_env() -> Self {
        Self {
            path: ledit_config::env::turn_log_file(),
        }
    }

    pub fn with_path(path: PathBuf) -> Self {
        Self { path: Some(path) }
    }

    pub fn disabled() -> Self {
        Self { path: None }
    }

    pub fn enabled(&self) -> bool {
        self.path.is_some()
    }

    pub fn append(&self, eval: &TurnEvaluation) {
        let Some(path) = &self.path else {
            return;
        };
        let line = match serde_json::to_string(eval) {
            Ok(l) => l,
            Err(e) => {
                warn!("could not serialize turn evaluation: {e}");
                return;
            }
        };
        let result = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .and_then(|mut f| writeln!(f, "{line}"));
        if let Err(e) = result {
            warn!(path = %path.display(), "could not append turn log: {e}");
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
