// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Environment-driven diagnostic toggles and runtime mode detection.
//!
//! These are the only process-wide switches in the engine; everything else
//! lives on per-session structs.

use std::path::PathBuf;

fn non_empty(var: &str) -> Option<String> {
    std::env::var(var).ok().filter(|v| !v.is_empty())
}

/// True when running under CI or when CI error semantics were forced.
///
/// In CI mode client failures terminate the process with a progress summary
/// instead of preserving the interactive session.
pub fn is_ci_mode() -> bool {
    non_empty("CI").is_some()
        || non_empty("GITHUB_ACTIONS").is_some()
        || non_empty("LEDIT_CI_MODE").is_some()
}

/// When set, every API response body is dumped to
/// `<state_dir>/api_response_<timestamp>.json`.
pub fn log_api_responses() -> bool {
    non_empty("LEDIT_LOG_API_RESPONSES").is_some()
}

/// Path of the append-only turn log (one JSON line per iteration), if enabled.
pub fn turn_log_file() -> Option<PathBuf> {
    non_empty("LEDIT_TURN_LOG_FILE").map(PathBuf::from)
}

/// When set, a per-message context-size breakdown is emitted on each call.
pub fn context_diag() -> bool {
    non_empty("LEDIT_CONTEXT_DIAG").is_some()
}

/// Directory for persisted debugging state (`lastResponse.json`, response
/// dumps).  Created on demand by writers; resolution itself never fails.
pub fn state_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".ledit")
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
