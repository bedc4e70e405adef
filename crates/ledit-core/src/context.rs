// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Context management: token estimation, lossless optimization, lossy
//! pruning, and the post-completion summarizer.
//!
//! All functions here are pure message-list transforms.  None of them may
//! orphan a tool result or strand an assistant tool call without its
//! results: providers reject such transcripts, so tool interaction groups
//! move as a unit or not at all.

use std::collections::{HashMap, HashSet};

use regex::Regex;
use tracing::{debug, info};

use ledit_model::{Message, Role};

/// Messages at the tail of the transcript that the pruner never touches.
const PROTECTED_TAIL: usize = 8;

/// Tool results older than this many messages are eligible for stale-output
/// compression in the optimizer.
const STALE_HORIZON: usize = 6;

/// A stale tool result longer than this gets compressed.
const STALE_COMPRESS_THRESHOLD: usize = 2000;

// ─── Token estimator ──────────────────────────────────────────────────────────

/// Deterministic token estimate for an outbound message set.
///
/// Character count / 4 per message body, ~20 tokens of framing per tool
/// call plus its name and argument text, ~10 tokens of framing per
/// message, and a 5% safety buffer on top.
pub fn estimate_tokens(messages: &[Message]) -> usize {
    let raw: usize = messages.iter().map(estimate_message).sum();
    raw + raw / 20
}

fn estimate_message(m: &Message) -> usize {
    let mut tokens = 10 + m.content.len() / 4;
    for tc in &m.tool_calls {
        tokens += 20 + (tc.name.len() + tc.arguments.len()) / 4;
    }
    tokens
}

/// Emit a per-message size breakdown when `LEDIT_CONTEXT_DIAG` is set.
pub fn maybe_log_breakdown(messages: &[Message]) {
    if !ledit_config::env::context_diag() {
        return;
    }
    for (i, m) in messages.iter().enumerate() {
        info!(
            index = i,
            role = ?m.role,
            tokens = estimate_message(m),
            tool_calls = m.tool_calls.len(),
            "context diag"
        );
    }
    info!(total = estimate_tokens(messages), "context diag total");
}

// ─── Optimizer ────────────────────────────────────────────────────────────────

/// Lossless-ish context reshaping.
///
/// Two passes, both of which preserve every message and every
/// tool-call/result pairing:
/// - **Duplicate-read elision**: when the same `(tool, arguments)` call
///   appears more than once, the results of all but the latest occurrence
///   are replaced with a short note.  Re-reads supersede old echoes.
/// - **Stale-output compression**: long tool results outside the recent
///   tail are cut to their head with an omission note.
pub fn optimize(messages: Vec<Message>) -> Vec<Message> {
    let mut messages = elide_duplicate_calls(messages);
    compress_stale_results(&mut messages);
    messages
}

fn elide_duplicate_calls(mut messages: Vec<Message>) -> Vec<Message> {
    // Latest call id per (tool, trimmed arguments).
    let mut latest: HashMap<(String, String), String> = HashMap::new();
    for m in messages.iter().filter(|m| m.role == Role::Assistant) {
        for tc in &m.tool_calls {
            latest.insert(
                (tc.name.clone(), tc.arguments.trim().to_string()),
                tc.id.clone(),
            );
        }
    }
    // Ids whose (tool, args) has a newer issue.
    let mut superseded: HashSet<String> = HashSet::new();
    for m in messages.iter().filter(|m| m.role == Role::Assistant) {
        for tc in &m.tool_calls {
            let key = (tc.name.clone(), tc.arguments.trim().to_string());
            if latest.get(&key).map(|id| id != &tc.id).unwrap_or(false) {
                superseded.insert(tc.id.clone());
            }
        }
    }
    if superseded.is_empty() {
        return messages;
    }
    for m in messages.iter_mut().filter(|m| m.role == Role::Tool) {
        let id = m.tool_call_id.as_deref().unwrap_or("");
        if superseded.contains(id) && m.content.len() > 80 {
            debug!(tool_call_id = id, "eliding result superseded by identical later call");
            m.content = "[result elided: the same call was repeated later in the conversation; \
                         see the most recent result]"
                .to_string();
        }
    }
    messages
}

fn compress_stale_results(messages: &mut [Message]) {
    let len = messages.len();
    let horizon = len.saturating_sub(STALE_HORIZON);
    for m in messages[..horizon]
        .iter_mut()
        .filter(|m| m.role == Role::Tool)
    {
        if m.content.len() > STALE_COMPRESS_THRESHOLD {
            let keep: String = m.content.chars().take(800).collect();
            let omitted = m.content.len() - keep.len();
            m.content = format!("{keep}\n[... {omitted} bytes of stale output trimmed ...]");
        }
    }
}

// ─── Pruner ───────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct PruneOutcome {
    pub messages: Vec<Message>,
    pub dropped: usize,
    pub aggressive: bool,
}

/// Drop oldest turns until the estimate fits under
/// `trigger_fraction × max_context_tokens`.
///
/// Turn groups move atomically: an assistant message with tool calls is
/// dropped together with every tool result answering it.  The most recent
/// messages are never dropped.  If group-dropping alone cannot get under
/// the threshold, the aggressive pass replaces the dropped turns with a
/// synthetic note naming the files touched, and hard-compresses older
/// tool results that remain.
pub fn prune(messages: Vec<Message>, max_context_tokens: usize, trigger_fraction: f32) -> PruneOutcome {
    let threshold = (max_context_tokens as f32 * trigger_fraction) as usize;
    if max_context_tokens == 0 || estimate_tokens(&messages) <= threshold {
        return PruneOutcome {
            messages,
            dropped: 0,
            aggressive: false,
        };
    }

    let groups = split_groups(&messages);
    let mut dropped_messages: Vec<Message> = Vec::new();
    let mut kept_groups: Vec<Vec<Message>> = groups;

    // Drop oldest non-system groups first, sparing the protected tail.
    let mut dropped = 0usize;
    loop {
        let flat: Vec<Message> = kept_groups.iter().flatten().cloned().collect();
        if estimate_tokens(&flat) <= threshold {
            break;
        }
        let tail_start = flat.len().saturating_sub(PROTECTED_TAIL);
        // Index of the first droppable group: non-system and fully before
        // the protected tail.
        let mut flat_pos = 0usize;
        let mut candidate: Option<usize> = None;
        for (gi, group) in kept_groups.iter().enumerate() {
            let group_end = flat_pos + group.len();
            let is_system = group.iter().any(|m| m.role == Role::System);
            if !is_system && group_end <= tail_start {
                candidate = Some(gi);
                break;
            }
            flat_pos = group_end;
        }
        match candidate {
            Some(gi) => {
                let group = kept_groups.remove(gi);
                dropped += group.len();
                dropped_messages.extend(group);
            }
            None => break,
        }
    }

    let mut result: Vec<Message> = kept_groups.into_iter().flatten().collect();
    result = orphan_sweep(result);

    let mut aggressive = false;
    if estimate_tokens(&result) > threshold && !dropped_messages.is_empty() {
        aggressive = true;
        // Hard-compress whatever old tool output remains.
        let horizon = result.len().saturating_sub(PROTECTED_TAIL / 2);
        for m in result[..horizon].iter_mut().filter(|m| m.role == Role::Tool) {
            if m.content.len() > 400 {
                let keep: String = m.content.chars().take(200).collect();
                m.content = format!("{keep}\n[... output truncated during context pruning ...]");
            }
        }
    }

    if !dropped_messages.is_empty() {
        let note = synthetic_note(&dropped_messages);
        let insert_at = result
            .iter()
            .position(|m| m.role != Role::System)
            .unwrap_or(result.len());
        result.insert(insert_at, note);
        debug!(
            dropped,
            aggressive,
            remaining = result.len(),
            "pruned old turns from context"
        );
    }

    PruneOutcome {
        messages: result,
        dropped,
        aggressive,
    }
}

/// Split a transcript into atomic groups: each assistant message with tool
/// calls travels with the tool results that answer it; every other message
/// is its own group.
fn split_groups(messages: &[Message]) -> Vec<Vec<Message>> {
    let mut groups: Vec<Vec<Message>> = Vec::new();
    let mut i = 0;
    while i < messages.len() {
        let m = &messages[i];
        if m.role == Role::Assistant && !m.tool_calls.is_empty() {
            let ids: HashSet<&str> = m.tool_calls.iter().map(|tc| tc.id.as_str()).collect();
            let mut group = vec![m.clone()];
            let mut j = i + 1;
            while j < messages.len() && messages[j].role == Role::Tool {
                let answers = messages[j]
                    .tool_call_id
                    .as_deref()
                    .map(|id| ids.contains(id))
                    .unwrap_or(false);
                if !answers {
                    break;
                }
                group.push(messages[j].clone());
                j += 1;
            }
            groups.push(group);
            i = j;
        } else {
            groups.push(vec![m.clone()]);
            i += 1;
        }
    }
    groups
}

/// Drop tool results whose issuing assistant message is gone.
fn orphan_sweep(messages: Vec<Message>) -> Vec<Message> {
    let valid_ids: HashSet<String> = messages
        .iter()
        .filter(|m| m.role == Role::Assistant)
        .flat_map(|m| m.tool_calls.iter().map(|tc| tc.id.clone()))
        .collect();
    messages
        .into_iter()
        .filter(|m| {
            if m.role != Role::Tool {
                return true;
            }
            m.tool_call_id
                .as_deref()
                .map(|id| valid_ids.contains(id))
                .unwrap_or(false)
        })
        .collect()
}

/// A synthetic system note summarizing dropped turns: the file identities
/// mentioned and the opening of each dropped assistant reply.
fn synthetic_note(dropped: &[Message]) -> Message {
    let path_re = Regex::new(r"[\w~./-]*[\w-]+\.[A-Za-z0-9]{1,8}\b").unwrap();
    let mut files: Vec<String> = Vec::new();
    let mut seen = HashSet::new();
    let mut decisions: Vec<String> = Vec::new();

    for m in dropped {
        for cap in path_re.find_iter(&m.content) {
            let f = cap.as_str().to_string();
            if f.contains('.') && seen.insert(f.clone()) {
                files.push(f);
            }
        }
        if m.role == Role::Assistant && !m.content.trim().is_empty() {
            let first_line = m.content.lines().next().unwrap_or("").trim();
            if !first_line.is_empty() {
                decisions.push(first_line.chars().take(120).collect());
            }
        }
    }
    files.truncate(20);
    decisions.truncate(8);

    let mut note = String::from(
        "[Earlier turns were removed to fit the context window. \
         Key facts from the removed history follow.]",
    );
    if !files.is_empty() {
        note.push_str("\nFiles discussed: ");
        note.push_str(&files.join(", "));
    }
    if !decisions.is_empty() {
        note.push_str("\nEarlier assistant statements:");
        for d in &decisions {
            note.push_str("\n- ");
            note.push_str(d);
        }
    }
    Message::system(note)
}

// ─── Completion summarizer ────────────────────────────────────────────────────

/// After a task completes, collapse everything before the final assistant
/// message into a short synthetic summary.  The final message is already
/// persisted when this runs; it stays in place as the last entry so
/// follow-up questions see the answer but not the tool noise that
/// produced it.
pub fn summarize_completed_task(messages: Vec<Message>) -> Vec<Message> {
    let Some(final_idx) = messages.iter().rposition(|m| m.role == Role::Assistant) else {
        return messages;
    };

    let first_query = messages
        .iter()
        .find(|m| m.role == Role::User)
        .map(|m| m.content.trim().chars().take(160).collect::<String>())
        .unwrap_or_default();

    let mut out: Vec<Message> = messages[..final_idx]
        .iter()
        .filter(|m| m.role == Role::System)
        .cloned()
        .collect();
    out.push(Message::assistant(format!(
        "[A previous task in this session is complete. Request: {first_query}. \
         The final answer follows in the next message; intermediate steps were discarded.]"
    )));
    out.extend(messages[final_idx..].iter().cloned());
    out
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use ledit_model::ToolCall;

    fn assistant_call(id: &str, name: &str, args: &str) -> Message {
        Message::assistant_with_tools("", vec![ToolCall::new(id, name, args)])
    }

    // ── Estimator ─────────────────────────────────────────────────────────────

    #[test]
    fn estimate_is_deterministic() {
        let msgs = vec![
            Message::user("hello world, this is a query"),
            assistant_call("c1", "read_file", r#"{"file_path":"a.rs"}"#),
            Message::tool_result("c1", "file contents here"),
        ];
        assert_eq!(estimate_tokens(&msgs), estimate_tokens(&msgs));
    }

    #[test]
    fn estimate_counts_framing_per_message() {
        // Two empty-ish messages still cost ~10 framing tokens each.
        let msgs = vec![Message::user(""), Message::user("")];
        assert!(estimate_tokens(&msgs) >= 20);
    }

    #[test]
    fn estimate_counts_tool_call_overhead() {
        let plain = vec![Message::assistant("")];
        let with_call = vec![assistant_call("c1", "read_file", "{}")];
        assert!(estimate_tokens(&with_call) > estimate_tokens(&plain) + 15);
    }

    #[test]
    fn estimate_includes_safety_buffer() {
        let msgs = vec![Message::user("x".repeat(4000))];
        // body 1000 + framing 10 → ×1.05 ≥ 1060
        assert!(estimate_tokens(&msgs) >= 1060);
    }

    // ── Optimizer ─────────────────────────────────────────────────────────────

    #[test]
    fn duplicate_read_elides_older_result() {
        let args = r#"{"file_path":"src/lib.rs"}"#;
        let long_body = "fn lib() {}\n".repeat(20);
        let msgs = vec![
            assistant_call("c1", "read_file", args),
            Message::tool_result("c1", long_body.clone()),
            Message::user("read it again"),
            assistant_call("c2", "read_file", args),
            Message::tool_result("c2", long_body.clone()),
        ];
        let out = optimize(msgs);
        assert!(out[1].content.contains("elided"));
        assert_eq!(out[4].content, long_body, "latest result must survive");
    }

    #[test]
    fn distinct_reads_are_untouched() {
        let msgs = vec![
            assistant_call("c1", "read_file", r#"{"file_path":"a.rs"}"#),
            Message::tool_result("c1", "a".repeat(200)),
            assistant_call("c2", "read_file", r#"{"file_path":"b.rs"}"#),
            Message::tool_result("c2", "b".repeat(200)),
        ];
        let out = optimize(msgs.clone());
        assert_eq!(out[1].content, msgs[1].content);
        assert_eq!(out[3].content, msgs[3].content);
    }

    #[test]
    fn stale_long_results_are_compressed() {
        let mut msgs = vec![
            assistant_call("c1", "shell_command", r#"{"command":"ls -R"}"#),
            Message::tool_result("c1", "x".repeat(5000)),
        ];
        // Pad the tail so the tool result falls outside the recent horizon.
        for i in 0..STALE_HORIZON {
            msgs.push(Message::user(format!("filler {i}")));
        }
        let out = optimize(msgs);
        assert!(out[1].content.len() < 1000);
        assert!(out[1].content.contains("trimmed"));
    }

    #[test]
    fn recent_results_are_never_compressed() {
        let msgs = vec![
            assistant_call("c1", "shell_command", "{}"),
            Message::tool_result("c1", "y".repeat(5000)),
        ];
        let out = optimize(msgs);
        assert_eq!(out[1].content.len(), 5000);
    }

    #[test]
    fn optimize_preserves_message_count_and_pairing() {
        let msgs = vec![
            Message::user("q"),
            assistant_call("c1", "read_file", "{}"),
            Message::tool_result("c1", "r".repeat(3000)),
            Message::assistant("done"),
        ];
        let out = optimize(msgs.clone());
        assert_eq!(out.len(), msgs.len());
        assert_eq!(out[2].tool_call_id.as_deref(), Some("c1"));
    }

    // ── Pruner ────────────────────────────────────────────────────────────────

    fn turn(i: usize) -> Vec<Message> {
        let id = format!("c{i}");
        vec![
            Message::user(format!("question {i}: {}", "pad ".repeat(100))),
            assistant_call(&id, "read_file", r#"{"file_path":"x.rs"}"#),
            Message::tool_result(&id, "data ".repeat(200)),
            Message::assistant(format!("answer {i}")),
        ]
    }

    #[test]
    fn prune_is_a_no_op_under_the_threshold() {
        let msgs = vec![Message::user("small")];
        let out = prune(msgs.clone(), 100_000, 0.8);
        assert_eq!(out.dropped, 0);
        assert_eq!(out.messages.len(), 1);
    }

    #[test]
    fn prune_drops_oldest_turns_first() {
        let mut msgs = Vec::new();
        for i in 0..10 {
            msgs.extend(turn(i));
        }
        let out = prune(msgs, 2000, 0.8);
        assert!(out.dropped > 0);
        let text: String = out
            .messages
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        // The newest turn survives, the oldest does not.
        assert!(text.contains("answer 9"));
        assert!(!text.contains("question 0:"));
    }

    #[test]
    fn prune_never_strands_a_tool_result() {
        let mut msgs = Vec::new();
        for i in 0..10 {
            msgs.extend(turn(i));
        }
        let out = prune(msgs, 2000, 0.8);
        let valid: HashSet<String> = out
            .messages
            .iter()
            .filter(|m| m.role == Role::Assistant)
            .flat_map(|m| m.tool_calls.iter().map(|tc| tc.id.clone()))
            .collect();
        for m in out.messages.iter().filter(|m| m.role == Role::Tool) {
            assert!(
                valid.contains(m.tool_call_id.as_deref().unwrap()),
                "orphaned tool result after prune"
            );
        }
    }

    #[test]
    fn prune_inserts_synthetic_note_for_dropped_turns() {
        let mut msgs = Vec::new();
        for i in 0..10 {
            msgs.extend(turn(i));
        }
        let out = prune(msgs, 2000, 0.8);
        assert!(out
            .messages
            .iter()
            .any(|m| m.role == Role::System && m.content.contains("removed to fit")));
    }

    #[test]
    fn synthetic_note_names_mentioned_files() {
        let dropped = vec![
            Message::user("please edit src/main.rs and README.md"),
            Message::assistant("I changed src/main.rs accordingly."),
        ];
        let note = synthetic_note(&dropped);
        assert!(note.content.contains("src/main.rs"));
        assert!(note.content.contains("README.md"));
    }

    #[test]
    fn prune_result_fits_when_enough_is_droppable() {
        let mut msgs = Vec::new();
        for i in 0..20 {
            msgs.extend(turn(i));
        }
        let max = 4000;
        let out = prune(msgs, max, 0.8);
        assert!(estimate_tokens(&out.messages) <= max);
    }

    // ── Completion summarizer ─────────────────────────────────────────────────

    #[test]
    fn summarizer_runs_after_final_message_persisted() {
        // The final assistant message is already in the transcript when the
        // summarizer runs, and it must remain the last message, unchanged.
        let msgs = vec![
            Message::user("fix the bug in parser.rs"),
            assistant_call("c1", "read_file", "{}"),
            Message::tool_result("c1", "contents"),
            Message::assistant("The bug is fixed."),
        ];
        let out = summarize_completed_task(msgs);
        assert_eq!(out.last().unwrap().content, "The bug is fixed.");
        assert!(out.len() < 4);
        assert!(out[0].content.contains("fix the bug in parser.rs"));
    }

    #[test]
    fn summarizer_keeps_system_messages() {
        let msgs = vec![
            Message::system("note"),
            Message::user("q"),
            Message::assistant("a"),
        ];
        let out = summarize_completed_task(msgs);
        assert_eq!(out[0].content, "note");
    }

    #[test]
    fn summarizer_without_assistant_is_a_no_op() {
        let msgs = vec![Message::user("just a question")];
        let out = summarize_completed_task(msgs.clone());
        assert_eq!(out.len(), 1);
    }
}
