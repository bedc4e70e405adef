// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Recovery of tool calls from assistant prose.
//!
//! Some models write their tool calls into the text stream instead of the
//! structured protocol: JSON envelopes, `<function=...>` tags, fenced
//! ```tool blocks, or plain prose ("I'll use read_file to ...").  This
//! module extracts such calls so they can be fed back through the normal
//! dispatch path, and returns the content with the envelopes stripped.

use regex::Regex;
use serde_json::{json, Value};
use tracing::{debug, warn};

/// One recovered call: the tool name and its JSON argument object.
/// Ids are synthesized by the caller so the per-query counter stays in one
/// place.
#[derive(Debug, Clone, PartialEq)]
pub struct RecoveredCall {
    pub name: String,
    pub arguments: Value,
}

/// Result of a successful fallback parse.
#[derive(Debug, Clone)]
pub struct FallbackParse {
    pub calls: Vec<RecoveredCall>,
    /// The assistant content with recovered envelopes removed.
    pub cleaned_content: String,
}

/// Fast check: does this content look like an attempted tool call at all?
///
/// Used by the orchestrator to decide whether to run the full parser on a
/// turn that arrived without structured `tool_calls`.
pub fn looks_like_tool_attempt(content: &str, known_tools: &[String]) -> bool {
    if content.contains("<function=")
        || content.contains("<tool_call>")
        || content.contains("```tool")
        || content.contains("```function")
    {
        return true;
    }
    if content.contains("\"tool_calls\"")
        || (content.contains("\"function\"") && content.contains('{'))
        || (content.contains("\"arguments\"") && content.contains('{'))
    {
        return true;
    }
    prose_cue(content, known_tools).is_some()
}

/// Extract tool calls from unstructured assistant content.
///
/// Recognizers are tried in order of reliability: XML-style envelopes,
/// fenced blocks, raw JSON envelopes, then prose cues.  Returns `None`
/// when nothing valid could be recovered.
pub fn parse_tool_calls(content: &str, known_tools: &[String]) -> Option<FallbackParse> {
    let mut calls = Vec::new();
    let mut cleaned = content.to_string();

    extract_function_tags(&mut cleaned, known_tools, &mut calls);
    extract_fenced_blocks(&mut cleaned, known_tools, &mut calls);
    if calls.is_empty() {
        extract_json_envelope(&mut cleaned, known_tools, &mut calls);
    }
    if calls.is_empty() {
        if let Some(call) = prose_cue(content, known_tools) {
            calls.push(call);
        }
    }

    if calls.is_empty() {
        return None;
    }
    debug!(count = calls.len(), "recovered tool calls from assistant text");
    Some(FallbackParse {
        calls,
        cleaned_content: cleaned.trim().to_string(),
    })
}

// ─── Recognizer: <function=name> envelopes ────────────────────────────────────

fn extract_function_tags(
    cleaned: &mut String,
    known_tools: &[String],
    calls: &mut Vec<RecoveredCall>,
) {
    let func_re = Regex::new(r"(?s)<function=([A-Za-z0-9_]+)>(.*?)</function>").unwrap();
    let param_re = Regex::new(r"(?s)<parameter=([A-Za-z0-9_]+)>(.*?)</parameter>").unwrap();

    let mut stripped = String::with_capacity(cleaned.len());
    let mut last = 0;
    for caps in func_re.captures_iter(cleaned) {
        let whole = caps.get(0).unwrap();
        let name = caps[1].to_string();
        let body = &caps[2];

        stripped.push_str(&cleaned[last..whole.start()]);
        last = whole.end();

        if !known_tools.is_empty() && !known_tools.iter().any(|t| t == &name) {
            warn!(tool = %name, "ignoring function envelope for unknown tool");
            continue;
        }

        let mut args = serde_json::Map::new();
        for p in param_re.captures_iter(body) {
            args.insert(p[1].to_string(), json!(p[2].trim()));
        }
        calls.push(RecoveredCall {
            name,
            arguments: Value::Object(args),
        });
    }
    stripped.push_str(&cleaned[last..]);
    *cleaned = stripped;
}

// ─── Recognizer: fenced ```tool / ```function blocks ──────────────────────────

fn extract_fenced_blocks(
    cleaned: &mut String,
    known_tools: &[String],
    calls: &mut Vec<RecoveredCall>,
) {
    let fence_re = Regex::new(r"(?s)```(?:tool|function)\n(.*?)```").unwrap();

    let mut stripped = String::with_capacity(cleaned.len());
    let mut last = 0;
    for caps in fence_re.captures_iter(cleaned) {
        let whole = caps.get(0).unwrap();
        stripped.push_str(&cleaned[last..whole.start()]);
        last = whole.end();

        if let Ok(v) = serde_json::from_str::<Value>(caps[1].trim()) {
            collect_from_json(&v, known_tools, calls);
        }
    }
    stripped.push_str(&cleaned[last..]);
    *cleaned = stripped;
}

// ─── Recognizer: raw JSON envelopes ───────────────────────────────────────────

fn extract_json_envelope(
    cleaned: &mut String,
    known_tools: &[String],
    calls: &mut Vec<RecoveredCall>,
) {
    // Only whole-content JSON (possibly with surrounding whitespace) is
    // accepted here; JSON embedded mid-sentence is too ambiguous to strip.
    let trimmed = cleaned.trim();
    if !trimmed.starts_with('{') {
        return;
    }
    let parsed = serde_json::from_str::<Value>(trimmed)
        .or_else(|_| serde_json::from_str::<Value>(&repair_json(trimmed)));
    if let Ok(v) = parsed {
        let before = calls.len();
        collect_from_json(&v, known_tools, calls);
        if calls.len() > before {
            cleaned.clear();
        }
    }
}

/// Pull calls out of a parsed JSON value in any of the envelope shapes:
/// `{"tool_calls":[...]}`, `{"function":{"name","arguments"}}`, or a bare
/// `{"name","arguments"}` object naming a known tool.
fn collect_from_json(v: &Value, known_tools: &[String], calls: &mut Vec<RecoveredCall>) {
    if let Some(list) = v.get("tool_calls").and_then(|t| t.as_array()) {
        for item in list {
            collect_from_json(item, known_tools, calls);
        }
        return;
    }
    if let Some(function) = v.get("function") {
        match function {
            Value::Object(_) => {
                collect_from_json(function, known_tools, calls);
            }
            Value::String(name) => {
                if let Some(call) = build_call(name, v.get("arguments"), known_tools) {
                    calls.push(call);
                }
            }
            _ => {}
        }
        return;
    }
    if let Some(name) = v.get("name").and_then(|n| n.as_str()) {
        if let Some(call) = build_call(name, v.get("arguments"), known_tools) {
            calls.push(call);
        }
    }
}

fn build_call(
    name: &str,
    arguments: Option<&Value>,
    known_tools: &[String],
) -> Option<RecoveredCall> {
    if !known_tools.is_empty() && !known_tools.iter().any(|t| t == name) {
        return None;
    }
    let args = match arguments {
        Some(Value::Object(m)) => Value::Object(m.clone()),
        // Arguments serialized as an embedded JSON string.
        Some(Value::String(s)) => parse_arguments(s),
        _ => json!({}),
    };
    Some(RecoveredCall {
        name: name.to_string(),
        arguments: args,
    })
}

// ─── Recognizer: prose cues ───────────────────────────────────────────────────

/// "I'll use read_file to look at `src/main.rs`" — an action verb, a known
/// tool name, and one extractable argument token.
fn prose_cue(content: &str, known_tools: &[String]) -> Option<RecoveredCall> {
    let verb_re = Regex::new(r"(?i)\b(use|using|call|calling|run|running|invoke|invoking)\b").unwrap();
    let verb = verb_re.find(content)?;

    let tool = known_tools
        .iter()
        .filter_map(|t| content[verb.end()..].find(t.as_str()).map(|pos| (pos, t)))
        .min_by_key(|(pos, _)| *pos)
        .map(|(_, t)| t.clone())?;

    // The argument is the first quoted, backticked, or path-shaped token
    // after the tool name.
    let after_tool = &content[verb.end()..];
    let after_tool = &after_tool[after_tool.find(tool.as_str())? + tool.len()..];
    let arg_re = Regex::new(r#""([^"]+)"|`([^`]+)`|'([^']+)'|(\S*[/.]\S+)"#).unwrap();
    let caps = arg_re.captures(after_tool)?;
    let arg = caps
        .get(1)
        .or_else(|| caps.get(2))
        .or_else(|| caps.get(3))
        .or_else(|| caps.get(4))?
        .as_str()
        .trim_end_matches(['.', ',', ';']);
    if arg.is_empty() {
        return None;
    }

    let key = primary_argument_key(&tool);
    Some(RecoveredCall {
        name: tool,
        arguments: json!({ key: arg }),
    })
}

/// Best-guess primary argument name when recovering from prose, where no
/// schema information is present in the text.
fn primary_argument_key(tool: &str) -> &'static str {
    if tool.contains("shell") || tool.contains("command") {
        "command"
    } else if tool.contains("file") {
        "file_path"
    } else {
        "path"
    }
}

// ─── Argument parsing and repair ──────────────────────────────────────────────

/// Parse a raw JSON argument string, repairing common model mistakes.
///
/// Never fails: unparseable arguments degrade to `{}` (with a warning) so
/// a malformed call still reaches the tool, which reports the missing
/// parameters in its own words.
pub fn parse_arguments(raw: &str) -> Value {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Value::Object(Default::default());
    }
    if let Ok(v) = serde_json::from_str::<Value>(trimmed) {
        if v.is_object() {
            return v;
        }
    }
    let repaired = repair_json(trimmed);
    match serde_json::from_str::<Value>(&repaired) {
        Ok(v) if v.is_object() => {
            warn!("repaired invalid JSON tool arguments");
            v
        }
        _ => {
            warn!(raw = %trimmed, "unparseable tool arguments; substituting {{}}");
            Value::Object(Default::default())
        }
    }
}

/// Attempt mechanical repairs of near-JSON: invalid escape sequences,
/// a missing closing quote, and a missing closing brace.
fn repair_json(raw: &str) -> String {
    let mut fixed = fix_invalid_escapes(raw);
    if !fixed.trim_end().ends_with('}') {
        let quote_count = fixed.chars().filter(|&c| c == '"').count();
        if quote_count % 2 == 1 {
            fixed.push('"');
        }
        fixed.push('}');
    }
    fixed
}

/// Replace invalid escape sequences inside string values with an escaped
/// backslash.  Valid JSON escapes are `"` `\` `/` `b` `f` `n` `r` `t` `u`.
fn fix_invalid_escapes(raw: &str) -> String {
    let mut result = String::with_capacity(raw.len() + 16);
    let mut chars = raw.chars();
    let mut in_string = false;

    while let Some(c) = chars.next() {
        if in_string {
            match c {
                '\\' => match chars.next() {
                    Some(next)
                        if matches!(next, '"' | '\\' | '/' | 'b' | 'f' | 'n' | 'r' | 't' | 'u') =>
                    {
                        result.push('\\');
                        result.push(next);
                    }
                    Some(next) => {
                        result.push('\\');
                        result.push('\\');
                        result.push(next);
                    }
                    None => result.push('\\'),
                },
                '"' => {
                    in_string = false;
                    result.push('"');
                }
                _ => result.push(c),
            }
        } else {
            if c == '"' {
                in_string = true;
            }
            result.push(c);
        }
    }
    result
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn tools() -> Vec<String> {
        vec![
            "read_file".into(),
            "write_file".into(),
            "shell_command".into(),
            "list_dir".into(),
        ]
    }

    // ── looks_like_tool_attempt ───────────────────────────────────────────────

    #[test]
    fn detects_function_tag_syntax() {
        assert!(looks_like_tool_attempt("<function=read_file>", &tools()));
    }

    #[test]
    fn detects_json_envelope_keys() {
        assert!(looks_like_tool_attempt(r#"{"tool_calls": []}"#, &tools()));
        assert!(looks_like_tool_attempt(r#"{"function": {"name": "x"}}"#, &tools()));
    }

    #[test]
    fn detects_fenced_tool_block() {
        assert!(looks_like_tool_attempt("```tool\n{}\n```", &tools()));
    }

    #[test]
    fn plain_prose_without_cues_is_not_an_attempt() {
        assert!(!looks_like_tool_attempt(
            "The file contains three functions.",
            &tools()
        ));
    }

    // ── Function-tag envelopes ────────────────────────────────────────────────

    #[test]
    fn recovers_function_tag_with_parameters() {
        let content = "I'll read it. <function=read_file><parameter=file_path>README.md</parameter></function>";
        let parsed = parse_tool_calls(content, &tools()).unwrap();
        assert_eq!(parsed.calls.len(), 1);
        assert_eq!(parsed.calls[0].name, "read_file");
        assert_eq!(parsed.calls[0].arguments["file_path"], "README.md");
        assert_eq!(parsed.cleaned_content, "I'll read it.");
    }

    #[test]
    fn recovers_multiple_function_tags_in_order() {
        let content = "<function=read_file><parameter=file_path>a.rs</parameter></function>\
                       <function=read_file><parameter=file_path>b.rs</parameter></function>";
        let parsed = parse_tool_calls(content, &tools()).unwrap();
        assert_eq!(parsed.calls.len(), 2);
        assert_eq!(parsed.calls[0].arguments["file_path"], "a.rs");
        assert_eq!(parsed.calls[1].arguments["file_path"], "b.rs");
    }

    #[test]
    fn unknown_tool_in_function_tag_is_ignored_but_stripped() {
        let content = "<function=rm_rf><parameter=path>/</parameter></function>ok";
        assert!(parse_tool_calls(content, &tools()).is_none());
    }

    // ── JSON envelopes ────────────────────────────────────────────────────────

    #[test]
    fn recovers_tool_calls_array_envelope() {
        let content = r#"{"tool_calls": [{"function": {"name": "read_file", "arguments": {"file_path": "x.rs"}}}]}"#;
        let parsed = parse_tool_calls(content, &tools()).unwrap();
        assert_eq!(parsed.calls[0].name, "read_file");
        assert_eq!(parsed.calls[0].arguments["file_path"], "x.rs");
        assert!(parsed.cleaned_content.is_empty());
    }

    #[test]
    fn recovers_bare_name_arguments_object() {
        let content = r#"{"name": "list_dir", "arguments": {"path": "src"}}"#;
        let parsed = parse_tool_calls(content, &tools()).unwrap();
        assert_eq!(parsed.calls[0].name, "list_dir");
    }

    #[test]
    fn recovers_arguments_embedded_as_json_string() {
        let content = r#"{"name": "read_file", "arguments": "{\"file_path\": \"y.rs\"}"}"#;
        let parsed = parse_tool_calls(content, &tools()).unwrap();
        assert_eq!(parsed.calls[0].arguments["file_path"], "y.rs");
    }

    #[test]
    fn json_naming_unknown_tool_is_rejected() {
        let content = r#"{"name": "format_disk", "arguments": {}}"#;
        assert!(parse_tool_calls(content, &tools()).is_none());
    }

    // ── Fenced blocks ─────────────────────────────────────────────────────────

    #[test]
    fn recovers_fenced_tool_block() {
        let content = "Running it now:\n```tool\n{\"name\": \"shell_command\", \"arguments\": {\"command\": \"ls\"}}\n```";
        let parsed = parse_tool_calls(content, &tools()).unwrap();
        assert_eq!(parsed.calls[0].name, "shell_command");
        assert_eq!(parsed.cleaned_content, "Running it now:");
    }

    // ── Prose cues ────────────────────────────────────────────────────────────

    #[test]
    fn recovers_prose_cue_with_backticked_path() {
        let content = "I'll use read_file to inspect `src/main.rs` first.";
        let parsed = parse_tool_calls(content, &tools()).unwrap();
        assert_eq!(parsed.calls[0].name, "read_file");
        assert_eq!(parsed.calls[0].arguments["file_path"], "src/main.rs");
    }

    #[test]
    fn recovers_prose_cue_with_bare_path() {
        let content = "Let me run read_file on README.md.";
        let parsed = parse_tool_calls(content, &tools()).unwrap();
        assert_eq!(parsed.calls[0].arguments["file_path"], "README.md");
    }

    #[test]
    fn prose_cue_for_shell_command_uses_command_key() {
        let content = "I'm going to invoke shell_command with `cargo test`.";
        let parsed = parse_tool_calls(content, &tools()).unwrap();
        assert_eq!(parsed.calls[0].name, "shell_command");
        assert_eq!(parsed.calls[0].arguments["command"], "cargo test");
    }

    #[test]
    fn prose_without_argument_token_is_not_recovered() {
        assert!(parse_tool_calls("I could use read_file here", &tools()).is_none());
    }

    // ── Argument parsing / repair ─────────────────────────────────────────────

    #[test]
    fn parse_arguments_valid_object_passes_through() {
        let v = parse_arguments(r#"{"path": "a"}"#);
        assert_eq!(v["path"], "a");
    }

    #[test]
    fn parse_arguments_empty_is_empty_object() {
        assert_eq!(parse_arguments(""), serde_json::json!({}));
        assert_eq!(parse_arguments("   "), serde_json::json!({}));
    }

    #[test]
    fn parse_arguments_repairs_invalid_escape() {
        let v = parse_arguments(r#"{"pattern": "\d+"}"#);
        assert_eq!(v["pattern"], "\\d+");
    }

    #[test]
    fn parse_arguments_repairs_truncated_object() {
        let v = parse_arguments(r#"{"file_path": "src/lib.rs"#);
        assert_eq!(v["file_path"], "src/lib.rs");
    }

    #[test]
    fn parse_arguments_garbage_degrades_to_empty_object() {
        assert_eq!(parse_arguments("not json at all"), serde_json::json!({}));
    }

    #[test]
    fn parse_arguments_non_object_json_degrades_to_empty_object() {
        assert_eq!(parse_arguments("[1,2,3]"), serde_json::json!({}));
    }
}
