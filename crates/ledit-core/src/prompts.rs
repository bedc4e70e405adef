// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! System prompt assembly.

const BASE_PROMPT: &str = "\
You are ledit, a coding agent operating on the user's repository through tools.

Rules:
- Use the provided tools to read, edit, and inspect files; never invent file contents.
- Read a file before editing it.
- Prefer several small, verifiable steps over one large speculative change.
- When a command or tool fails, read the error and adjust; do not repeat the identical call.
- Keep answers concise. Do not restate tool output the user has already seen.

When the task is fully complete, end your final message with [[TASK_COMPLETE]].";

/// Build the active system prompt.  A user-supplied override replaces the
/// built-in text entirely; the completion-sentinel instruction is appended
/// to overrides that do not mention it, since the loop depends on it.
pub fn system_prompt(custom: Option<&str>) -> String {
    match custom {
        None => BASE_PROMPT.to_string(),
        Some(text) if text.to_lowercase().contains("task_complete") => text.to_string(),
        Some(text) => format!(
            "{text}\n\nWhen the task is fully complete, end your final message with [[TASK_COMPLETE]]."
        ),
    }
}
