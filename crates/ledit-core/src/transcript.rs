// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Append-only message store and the transcript sanitizer.
//!
//! The sanitizer is a pure function run on every snapshot handed to the
//! API client.  It removes structural damage — orphaned or duplicated tool
//! results, stale system prompts, consecutive duplicate assistant turns —
//! and never invents content.  Heterogeneous providers reject transcripts
//! that violate these rules with opaque 400s, so the sweep runs
//! unconditionally before every outbound request.

use std::collections::HashSet;

use tracing::{debug, warn};
use uuid::Uuid;

use ledit_model::{Message, Role};

/// The conversation transcript for one session.  Only the orchestrator
/// mutates it; every other component receives sanitized snapshots.
pub struct Transcript {
    id: String,
    messages: Vec<Message>,
}

impl Transcript {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            messages: Vec::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn push(&mut self, msg: Message) {
        self.messages.push(msg);
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }

    /// Replace the message list wholesale (pruning, completion summary).
    pub fn replace(&mut self, messages: Vec<Message>) {
        self.messages = messages;
    }

    /// Rewrite the content of the last assistant message.  Used exactly
    /// once per query, to strip the completion sentinel; transcripts are
    /// otherwise append-only.
    pub fn rewrite_last_assistant_content(&mut self, content: String) {
        if let Some(m) = self
            .messages
            .iter_mut()
            .rev()
            .find(|m| m.role == Role::Assistant)
        {
            m.content = content;
        }
    }

    /// Sanitized snapshot for an outbound request.
    pub fn snapshot(&self, active_system_prompt: &str, strict_alternation: bool) -> Vec<Message> {
        sanitize(&self.messages, active_system_prompt, strict_alternation)
    }
}

impl Default for Transcript {
    fn default() -> Self {
        Self::new()
    }
}

/// Enforce the transcript invariants on a message list.
///
/// 1. every tool message's id matches a ToolCall in an earlier assistant
///    message (orphans are dropped, as are tool messages with no id),
/// 2. no two tool messages share an id (keep first),
/// 3. no historical system message equals the active system prompt (it is
///    re-prepended fresh at send time),
/// 4. consecutive duplicate assistant messages with identical content and
///    tool-call id set collapse to one.
///
/// Idempotent: a second pass over the output changes nothing.
pub fn sanitize(
    messages: &[Message],
    active_system_prompt: &str,
    strict_alternation: bool,
) -> Vec<Message> {
    // Valid ids come from the full list, not the running prefix: a tool
    // result is only an orphan when NO assistant message issued its id.
    let valid_ids: HashSet<&str> = messages
        .iter()
        .filter(|m| m.role == Role::Assistant)
        .flat_map(|m| m.tool_calls.iter().map(|tc| tc.id.as_str()))
        .collect();

    let mut out: Vec<Message> = Vec::with_capacity(messages.len());
    let mut seen_tool_ids: HashSet<String> = HashSet::new();

    for msg in messages {
        match msg.role {
            Role::Tool => {
                let id = msg.tool_call_id.as_deref().unwrap_or("");
                if id.is_empty() || !valid_ids.contains(id) {
                    debug!(
                        tool_call_id = id,
                        snippet = snippet(&msg.content),
                        "dropping orphan tool result"
                    );
                    continue;
                }
                if !seen_tool_ids.insert(id.to_string()) {
                    debug!(
                        tool_call_id = id,
                        snippet = snippet(&msg.content),
                        "dropping duplicate tool result"
                    );
                    continue;
                }
                out.push(msg.clone());
            }
            Role::System => {
                if msg.content == active_system_prompt {
                    debug!("dropping historical copy of the active system prompt");
                    continue;
                }
                out.push(msg.clone());
            }
            Role::Assistant => {
                if let Some(prev) = out.last() {
                    if prev.role == Role::Assistant
                        && prev.content == msg.content
                        && id_set(prev) == id_set(msg)
                    {
                        debug!(
                            snippet = snippet(&msg.content),
                            "collapsing consecutive duplicate assistant message"
                        );
                        continue;
                    }
                }
                out.push(msg.clone());
            }
            Role::User => out.push(msg.clone()),
        }
    }

    if strict_alternation {
        validate_strict_alternation(&out);
    }
    out
}

fn id_set(m: &Message) -> HashSet<&str> {
    m.tool_calls.iter().map(|tc| tc.id.as_str()).collect()
}

fn snippet(content: &str) -> String {
    content.chars().take(80).collect()
}

/// Log-only validation for providers that mandate strict role alternation:
/// the tool results for an assistant's calls must immediately follow it
/// with no intervening user or assistant message.
fn validate_strict_alternation(messages: &[Message]) {
    for (i, msg) in messages.iter().enumerate() {
        if msg.role != Role::Assistant || msg.tool_calls.is_empty() {
            continue;
        }
        let expected: HashSet<&str> = msg.tool_calls.iter().map(|tc| tc.id.as_str()).collect();
        let mut answered: HashSet<&str> = HashSet::new();
        for follower in &messages[i + 1..] {
            if follower.role != Role::Tool {
                break;
            }
            if let Some(id) = follower.tool_call_id.as_deref() {
                if expected.contains(id) {
                    answered.insert(id);
                }
            }
        }
        if answered.len() != expected.len() {
            warn!(
                position = i,
                expected = expected.len(),
                answered = answered.len(),
                "strict-alternation violation: tool results do not immediately follow their assistant message"
            );
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use ledit_model::ToolCall;

    const SYS: &str = "You are a coding agent.";

    fn assistant_with_call(id: &str) -> Message {
        Message::assistant_with_tools(
            "",
            vec![ToolCall::new(id, "read_file", r#"{"file_path":"a"}"#)],
        )
    }

    #[test]
    fn new_transcripts_have_unique_ids() {
        assert_ne!(Transcript::new().id(), Transcript::new().id());
    }

    #[test]
    fn clean_transcript_passes_through_unchanged() {
        let msgs = vec![
            Message::user("hi"),
            assistant_with_call("c1"),
            Message::tool_result("c1", "result"),
            Message::assistant("done"),
        ];
        let s = sanitize(&msgs, SYS, false);
        assert_eq!(s.len(), 4);
    }

    #[test]
    fn orphan_tool_result_is_dropped() {
        let msgs = vec![
            Message::user("hi"),
            Message::tool_result("ghost", "result from nowhere"),
        ];
        let s = sanitize(&msgs, SYS, false);
        assert_eq!(s.len(), 1);
        assert_eq!(s[0].role, Role::User);
    }

    #[test]
    fn tool_result_with_empty_id_is_dropped() {
        let mut m = Message::tool_result("", "x");
        m.tool_call_id = Some(String::new());
        let s = sanitize(&[m], SYS, false);
        assert!(s.is_empty());
    }

    #[test]
    fn duplicate_tool_results_keep_first() {
        let msgs = vec![
            assistant_with_call("c1"),
            Message::tool_result("c1", "first"),
            Message::tool_result("c1", "second"),
        ];
        let s = sanitize(&msgs, SYS, false);
        let tools: Vec<&Message> = s.iter().filter(|m| m.role == Role::Tool).collect();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].content, "first");
    }

    #[test]
    fn active_system_prompt_copies_are_removed() {
        let msgs = vec![
            Message::system(SYS),
            Message::user("hi"),
            Message::system("some other note"),
        ];
        let s = sanitize(&msgs, SYS, false);
        assert_eq!(s.len(), 2);
        assert!(s.iter().all(|m| m.content != SYS));
    }

    #[test]
    fn consecutive_duplicate_assistants_collapse() {
        let msgs = vec![
            Message::assistant("same reply"),
            Message::assistant("same reply"),
        ];
        let s = sanitize(&msgs, SYS, false);
        assert_eq!(s.len(), 1);
    }

    #[test]
    fn duplicate_assistants_with_different_tool_ids_are_kept() {
        let msgs = vec![assistant_with_call("c1"), assistant_with_call("c2")];
        let s = sanitize(&msgs, SYS, false);
        assert_eq!(s.len(), 2);
    }

    #[test]
    fn non_consecutive_duplicates_are_kept() {
        let msgs = vec![
            Message::assistant("reply"),
            Message::user("again"),
            Message::assistant("reply"),
        ];
        let s = sanitize(&msgs, SYS, false);
        assert_eq!(s.len(), 3);
    }

    #[test]
    fn tool_result_before_its_assistant_is_kept_by_id_match() {
        // Orphan detection matches on the whole transcript; ordering issues
        // are the strict-alternation validator's concern, not a drop.
        let msgs = vec![
            Message::tool_result("c1", "early"),
            assistant_with_call("c1"),
        ];
        let s = sanitize(&msgs, SYS, false);
        assert_eq!(s.len(), 2);
    }

    #[test]
    fn sanitize_is_idempotent() {
        let msgs = vec![
            Message::system(SYS),
            Message::user("hi"),
            assistant_with_call("c1"),
            Message::tool_result("c1", "r"),
            Message::tool_result("c1", "dup"),
            Message::tool_result("ghost", "orphan"),
            Message::assistant("done"),
            Message::assistant("done"),
        ];
        let once = sanitize(&msgs, SYS, false);
        let twice = sanitize(&once, SYS, false);
        assert_eq!(
            serde_json::to_string(&once).unwrap(),
            serde_json::to_string(&twice).unwrap()
        );
    }

    #[test]
    fn rewrite_last_assistant_content_targets_the_last_one() {
        let mut t = Transcript::new();
        t.push(Message::assistant("first"));
        t.push(Message::user("q"));
        t.push(Message::assistant("second [[TASK_COMPLETE]]"));
        t.rewrite_last_assistant_content("second".into());
        assert_eq!(t.messages()[0].content, "first");
        assert_eq!(t.messages()[2].content, "second");
    }

    #[test]
    fn snapshot_applies_sanitizer() {
        let mut t = Transcript::new();
        t.push(Message::user("hi"));
        t.push(Message::tool_result("ghost", "orphan"));
        let s = t.snapshot(SYS, false);
        assert_eq!(s.len(), 1);
    }
}
