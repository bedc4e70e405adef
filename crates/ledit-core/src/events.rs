// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use ledit_model::Usage;

/// Events emitted by the engine during a query.  Consumers (CLI, a future
/// TUI) subscribe to drive their output; the engine never holds a
/// back-reference to its front-end.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// A sanitized text chunk streamed from the model
    TextDelta(String),
    /// The full assistant text for one iteration, after streaming finished
    TextComplete(String),
    /// A tool call is about to run
    ToolCallStarted {
        call_id: String,
        tool_name: String,
        arguments: String,
    },
    /// A tool call finished
    ToolCallFinished {
        call_id: String,
        tool_name: String,
        output: String,
        is_error: bool,
    },
    /// Token usage for one completed model call, plus session totals
    TokenUsage { turn: Usage, session: Usage },
    /// Old turns were pruned from the outbound context
    ContextPruned {
        tokens_before: usize,
        tokens_after: usize,
        aggressive: bool,
    },
    /// A loop guardrail injected a corrective reminder
    Reminder(String),
    /// The query finished (successfully or not)
    QueryComplete,
}
