// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::Value;

/// A single tool invocation as handed to the executor: the opaque call id
/// from the model plus parsed JSON arguments.
#[derive(Debug, Clone)]
pub struct ToolInvocation {
    pub id: String,
    pub name: String,
    pub args: Value,
}

impl ToolInvocation {
    pub fn new(id: impl Into<String>, name: impl Into<String>, args: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            args,
        }
    }
}

/// The result of executing one tool call.
///
/// Tool failures are data, not errors: the conversation continues with the
/// failure text as the tool result, which keeps every call id answered in
/// the transcript.
#[derive(Debug, Clone)]
pub struct ToolOutcome {
    pub call_id: String,
    pub name: String,
    pub content: String,
    pub is_error: bool,
}

impl ToolOutcome {
    pub fn ok(call_id: impl Into<String>, name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            name: name.into(),
            content: content.into(),
            is_error: false,
        }
    }

    pub fn err(call_id: impl Into<String>, name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            name: name.into(),
            content: msg.into(),
            is_error: true,
        }
    }
}

/// Trait that every built-in and user-defined tool implements.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON Schema for the parameters object
    fn parameters_schema(&self) -> Value;
    /// Permission labels a host may require before running this tool.
    fn required_permissions(&self) -> &[&str] {
        &[]
    }
    /// Pure reads may be dispatched in parallel; anything that mutates
    /// state keeps the default and runs sequentially.
    fn read_only(&self) -> bool {
        false
    }
    /// Execute with parsed arguments.  An `Err` here is converted by the
    /// executor into an error-flagged [`ToolOutcome`].
    async fn execute(&self, args: &Value) -> anyhow::Result<String>;
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
