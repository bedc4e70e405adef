// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use anyhow::Context;
use async_trait::async_trait;
use serde_json::{json, Value};

use crate::tool::Tool;

/// Output larger than this is cut from the middle; the head carries the
/// command preamble and the tail the final result.
const MAX_OUTPUT_BYTES: usize = 24_000;

pub struct ShellCommandTool;

#[async_trait]
impl Tool for ShellCommandTool {
    fn name(&self) -> &str {
        "shell_command"
    }

    fn description(&self) -> &str {
        "Run a shell command with `sh -c` and return its combined \
         stdout/stderr and exit status."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": { "type": "string" }
            },
            "required": ["command"],
            "additionalProperties": false
        })
    }

    fn required_permissions(&self) -> &[&str] {
        &["process.spawn"]
    }

    async fn execute(&self, args: &Value) -> anyhow::Result<String> {
        let command = args["command"]
            .as_str()
            .context("missing required parameter 'command'")?;

        let output = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .output()
            .await
            .with_context(|| format!("failed to spawn: {command}"))?;

        let mut text = String::new();
        text.push_str(&String::from_utf8_lossy(&output.stdout));
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.is_empty() {
            if !text.is_empty() {
                text.push('\n');
            }
            text.push_str("stderr:\n");
            text.push_str(&stderr);
        }
        if !output.status.success() {
            text.push_str(&format!(
                "\n[exit status: {}]",
                output.status.code().unwrap_or(-1)
            ));
        }
        Ok(truncate_middle(&text, MAX_OUTPUT_BYTES))
    }
}

/// Keep the head and tail of oversized output with an omission notice.
/// Cuts land on line boundaries where possible, and always on character
/// boundaries.
fn truncate_middle(text: &str, cap: usize) -> String {
    if text.len() <= cap {
        return text.to_string();
    }
    let half = cap / 2;

    let mut head_cut = half.min(text.len());
    while !text.is_char_boundary(head_cut) {
        head_cut -= 1;
    }
    let head_end = text[..head_cut].rfind('\n').map(|p| p + 1).unwrap_or(head_cut);

    let mut tail_cut = text.len() - half.min(text.len());
    while !text.is_char_boundary(tail_cut) {
        tail_cut += 1;
    }
    let tail_start = text[tail_cut..]
        .find('\n')
        .map(|p| tail_cut + p + 1)
        .unwrap_or(tail_cut);

    format!(
        "{}\n[... {} bytes omitted ...]\n{}",
        &text[..head_end],
        tail_start - head_end,
        &text[tail_start..]
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_stdout() {
        let out = ShellCommandTool
            .execute(&json!({"command": "echo hello"}))
            .await
            .unwrap();
        assert_eq!(out.trim(), "hello");
    }

    #[tokio::test]
    async fn captures_stderr_and_exit_status() {
        let out = ShellCommandTool
            .execute(&json!({"command": "echo oops >&2; exit 3"}))
            .await
            .unwrap();
        assert!(out.contains("stderr:"));
        assert!(out.contains("oops"));
        assert!(out.contains("[exit status: 3]"));
    }

    #[tokio::test]
    async fn missing_command_is_error() {
        let err = ShellCommandTool.execute(&json!({})).await.err().unwrap();
        assert!(err.to_string().contains("command"));
    }

    #[test]
    fn truncate_middle_keeps_head_and_tail() {
        let lines: String = (0..2000).map(|i| format!("line {i}\n")).collect();
        let cut = truncate_middle(&lines, 1000);
        assert!(cut.len() < lines.len());
        assert!(cut.contains("line 0"));
        assert!(cut.contains("line 1999"));
        assert!(cut.contains("omitted"));
    }

    #[test]
    fn truncate_middle_is_a_no_op_when_small() {
        assert_eq!(truncate_middle("short", 1000), "short");
    }
}
