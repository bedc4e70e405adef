// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! OpenAI-compatible chat completion driver.
//!
//! Every hosted and local provider this engine talks to speaks the same
//! `/chat/completions` SSE wire format; this single driver is configured
//! per provider with its base URL, auth style, and extra headers.

use anyhow::{bail, Context};
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tracing::debug;

use crate::{
    provider::ResponseStream, ChatRequest, FinishReason, Message, ResponseEvent, Role, Usage,
};

/// How to send the API key in HTTP requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthStyle {
    /// `Authorization: Bearer <key>` — most providers.
    Bearer,
    /// `api-key: <key>` header.
    ApiKeyHeader,
    /// No authentication header — local servers.
    None,
}

pub struct OpenAiCompatProvider {
    driver_name: String,
    model: String,
    api_key: Option<String>,
    chat_url: String,
    max_tokens: u32,
    temperature: f32,
    client: reqwest::Client,
    extra_headers: Vec<(String, String)>,
    auth_style: AuthStyle,
}

impl OpenAiCompatProvider {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        driver_name: impl Into<String>,
        model: String,
        api_key: Option<String>,
        base_url: &str,
        max_tokens: Option<u32>,
        temperature: Option<f32>,
        extra_headers: Vec<(String, String)>,
        auth_style: AuthStyle,
    ) -> Self {
        let base = base_url.trim_end_matches('/');
        Self {
            driver_name: driver_name.into(),
            model,
            api_key,
            chat_url: format!("{base}/chat/completions"),
            max_tokens: max_tokens.unwrap_or(4096),
            temperature: temperature.unwrap_or(0.2),
            client: reqwest::Client::new(),
            extra_headers,
            auth_style,
        }
    }
}

#[async_trait]
impl crate::ChatProvider for OpenAiCompatProvider {
    fn provider(&self) -> &str {
        &self.driver_name
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn complete(&self, req: ChatRequest) -> anyhow::Result<ResponseStream> {
        let messages = build_wire_messages(&req.messages);

        let tools: Vec<Value> = req
            .tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    }
                })
            })
            .collect();

        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "stream": req.stream,
            "max_tokens": self.max_tokens,
            "temperature": self.temperature,
        });
        if req.stream {
            body["stream_options"] = json!({ "include_usage": true });
        }
        if !tools.is_empty() {
            body["tools"] = json!(tools);
        }
        if let Some(effort) = &req.reasoning_effort {
            body["reasoning_effort"] = json!(effort);
        }

        debug!(
            driver = %self.driver_name,
            model = %self.model,
            tool_count = tools.len(),
            message_count = messages.len(),
            "sending completion request"
        );

        let mut http_req = self.client.post(&self.chat_url).json(&body);
        http_req = match self.auth_style {
            AuthStyle::Bearer => {
                let key = self
                    .api_key
                    .as_deref()
                    .context("API key not set; provide api_key or api_key_env in config")?;
                http_req.bearer_auth(key)
            }
            AuthStyle::ApiKeyHeader => {
                let key = self
                    .api_key
                    .as_deref()
                    .context("API key not set; provide api_key or api_key_env in config")?;
                http_req.header("api-key", key)
            }
            AuthStyle::None => http_req,
        };
        for (name, val) in &self.extra_headers {
            http_req = http_req.header(name.as_str(), val.as_str());
        }

        let resp = http_req
            .send()
            .await
            .with_context(|| format!("{} request failed", self.driver_name))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            bail!("{} error {status}: {text}", self.driver_name);
        }

        if !req.stream {
            let body: Value = resp.json().await.context("reading response body")?;
            let events = parse_full_response(&body);
            return Ok(Box::pin(futures::stream::iter(events.into_iter().map(Ok))));
        }

        let byte_stream = resp.bytes_stream();
        // SSE events can be split across TCP packets.  Maintain a line buffer
        // across chunks; emit events only for complete lines.
        let event_stream = byte_stream
            .scan(String::new(), |buf, chunk| {
                let events: Vec<anyhow::Result<ResponseEvent>> = match chunk {
                    Ok(b) => {
                        buf.push_str(&String::from_utf8_lossy(&b));
                        drain_complete_sse_lines(buf)
                    }
                    Err(e) => vec![Err(anyhow::anyhow!(e))],
                };
                std::future::ready(Some(events))
            })
            .flat_map(futures::stream::iter);

        Ok(Box::pin(event_stream))
    }
}

/// Drain all complete `\n`-terminated SSE lines from `buf`, leaving any
/// trailing incomplete line in place for the next TCP chunk to extend.
pub(crate) fn drain_complete_sse_lines(buf: &mut String) -> Vec<anyhow::Result<ResponseEvent>> {
    let mut events = Vec::new();
    while let Some(nl_pos) = buf.find('\n') {
        let line = buf[..nl_pos].trim_end_matches('\r').to_string();
        *buf = buf[nl_pos + 1..].to_string();
        if let Some(evs) = parse_sse_data_line(&line) {
            events.extend(evs);
        }
    }
    events
}

/// Parse a single complete SSE `data:` line.  Returns `None` for empty or
/// comment lines and unparseable payloads.
fn parse_sse_data_line(line: &str) -> Option<Vec<anyhow::Result<ResponseEvent>>> {
    let data = line.strip_prefix("data: ")?.trim();
    if data.is_empty() {
        return None;
    }
    if data == "[DONE]" {
        return Some(vec![Ok(ResponseEvent::Done)]);
    }
    let v: Value = serde_json::from_str(data).ok()?;
    Some(parse_sse_chunk(&v))
}

fn parse_usage(usage: &Value) -> Usage {
    let cached_tokens = usage
        .get("prompt_tokens_details")
        .and_then(|d| d.get("cached_tokens"))
        .and_then(|t| t.as_u64())
        .or_else(|| usage.get("prompt_cache_hit_tokens").and_then(|t| t.as_u64()))
        .unwrap_or(0) as u32;
    Usage {
        prompt_tokens: usage["prompt_tokens"].as_u64().unwrap_or(0) as u32,
        completion_tokens: usage["completion_tokens"].as_u64().unwrap_or(0) as u32,
        total_tokens: usage["total_tokens"].as_u64().unwrap_or(0) as u32,
        estimated_cost: usage["estimated_cost"].as_f64().unwrap_or(0.0),
        cached_tokens,
    }
}

fn parse_sse_chunk(v: &Value) -> Vec<anyhow::Result<ResponseEvent>> {
    // Usage-only chunk (emitted when stream_options.include_usage = true).
    if let Some(usage) = v.get("usage").filter(|u| !u.is_null()) {
        return vec![Ok(ResponseEvent::Usage(parse_usage(usage)))];
    }

    let choice = &v["choices"][0];
    let mut events = Vec::new();

    if let Some(reason) = choice["finish_reason"].as_str() {
        events.push(Ok(ResponseEvent::Finish(FinishReason::parse(reason))));
    }

    let delta = &choice["delta"];

    if let Some(tool_calls) = delta.get("tool_calls").and_then(|t| t.as_array()) {
        for tc in tool_calls {
            events.push(Ok(ResponseEvent::ToolCallDelta {
                index: tc["index"].as_u64().unwrap_or(0) as u32,
                id: tc["id"].as_str().unwrap_or("").to_string(),
                name: tc["function"]["name"].as_str().unwrap_or("").to_string(),
                arguments: tc["function"]["arguments"].as_str().unwrap_or("").to_string(),
            }));
        }
        return events;
    }

    // Reasoning delta: `reasoning_content` (DeepSeek, llama.cpp) with
    // `reasoning` (OpenRouter) as the fallback spelling.
    let thinking = delta
        .get("reasoning_content")
        .and_then(|c| c.as_str())
        .or_else(|| delta.get("reasoning").and_then(|c| c.as_str()));
    if let Some(thinking) = thinking {
        if !thinking.is_empty() {
            events.push(Ok(ResponseEvent::ReasoningDelta(thinking.to_string())));
            return events;
        }
    }

    if let Some(text) = delta.get("content").and_then(|c| c.as_str()) {
        if !text.is_empty() {
            events.push(Ok(ResponseEvent::TextDelta(text.to_string())));
        }
    }
    events
}

/// Convert a non-streaming response body into the same event vocabulary the
/// streaming path produces, so the client assembles both identically.
fn parse_full_response(v: &Value) -> Vec<ResponseEvent> {
    let mut events = Vec::new();
    let choice = &v["choices"][0];
    let message = &choice["message"];

    if let Some(reasoning) = message
        .get("reasoning_content")
        .and_then(|c| c.as_str())
        .filter(|s| !s.is_empty())
    {
        events.push(ResponseEvent::ReasoningDelta(reasoning.to_string()));
    }
    if let Some(text) = message.get("content").and_then(|c| c.as_str()) {
        if !text.is_empty() {
            events.push(ResponseEvent::TextDelta(text.to_string()));
        }
    }
    if let Some(tool_calls) = message.get("tool_calls").and_then(|t| t.as_array()) {
        for (i, tc) in tool_calls.iter().enumerate() {
            events.push(ResponseEvent::ToolCallDelta {
                index: i as u32,
                id: tc["id"].as_str().unwrap_or("").to_string(),
                name: tc["function"]["name"].as_str().unwrap_or("").to_string(),
                arguments: tc["function"]["arguments"].as_str().unwrap_or("").to_string(),
            });
        }
    }
    if let Some(reason) = choice["finish_reason"].as_str() {
        events.push(ResponseEvent::Finish(FinishReason::parse(reason)));
    }
    if let Some(usage) = v.get("usage").filter(|u| !u.is_null()) {
        events.push(ResponseEvent::Usage(parse_usage(usage)));
    }
    events.push(ResponseEvent::Done);
    events
}

fn role_str(r: &Role) -> &'static str {
    match r {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    }
}

/// Serialize the transcript into the wire-format JSON array.
///
/// Extracted as a free function so it can be unit-tested without HTTP.
pub(crate) fn build_wire_messages(messages: &[Message]) -> Vec<Value> {
    messages
        .iter()
        .map(|m| {
            let mut v = json!({
                "role": role_str(&m.role),
                "content": m.content,
            });
            if !m.tool_calls.is_empty() {
                let calls: Vec<Value> = m
                    .tool_calls
                    .iter()
                    .map(|tc| {
                        json!({
                            "id": tc.id,
                            "type": "function",
                            "function": {
                                "name": tc.name,
                                "arguments": tc.arguments,
                            }
                        })
                    })
                    .collect();
                v["tool_calls"] = json!(calls);
            }
            if let Some(id) = &m.tool_call_id {
                v["tool_call_id"] = json!(id);
            }
            v
        })
        .collect()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ChatProvider;

    fn make_provider() -> OpenAiCompatProvider {
        OpenAiCompatProvider::new(
            "test-compat",
            "test-model".into(),
            None,
            "http://localhost:9999/v1",
            Some(1024),
            Some(0.0),
            vec![],
            AuthStyle::None,
        )
    }

    #[test]
    fn provider_returns_driver_name() {
        assert_eq!(make_provider().provider(), "test-compat");
    }

    #[test]
    fn chat_url_appends_path() {
        assert_eq!(
            make_provider().chat_url,
            "http://localhost:9999/v1/chat/completions"
        );
    }

    #[test]
    fn base_url_trailing_slash_stripped() {
        let p = OpenAiCompatProvider::new(
            "x",
            "m".into(),
            None,
            "http://localhost:1234/v1/",
            None,
            None,
            vec![],
            AuthStyle::None,
        );
        assert_eq!(p.chat_url, "http://localhost:1234/v1/chat/completions");
    }

    // ── SSE chunk parsing ─────────────────────────────────────────────────────

    fn single_event(v: Value) -> ResponseEvent {
        let mut events = parse_sse_chunk(&v);
        assert_eq!(events.len(), 1, "expected one event: {events:?}");
        events.remove(0).unwrap()
    }

    #[test]
    fn parse_text_delta() {
        let ev = single_event(json!({"choices": [{"delta": {"content": "hello"}}]}));
        assert!(matches!(ev, ResponseEvent::TextDelta(t) if t == "hello"));
    }

    #[test]
    fn parse_reasoning_content_delta() {
        let ev = single_event(json!({
            "choices": [{"delta": {"content": "", "reasoning_content": "thinking"}}]
        }));
        assert!(matches!(ev, ResponseEvent::ReasoningDelta(t) if t == "thinking"));
    }

    #[test]
    fn parse_openrouter_reasoning_field() {
        let ev = single_event(json!({
            "choices": [{"delta": {"reasoning": "hmm"}}]
        }));
        assert!(matches!(ev, ResponseEvent::ReasoningDelta(t) if t == "hmm"));
    }

    #[test]
    fn empty_reasoning_falls_through_to_text() {
        let ev = single_event(json!({
            "choices": [{"delta": {"content": "answer", "reasoning_content": ""}}]
        }));
        assert!(matches!(ev, ResponseEvent::TextDelta(t) if t == "answer"));
    }

    #[test]
    fn parse_tool_call_delta_with_index() {
        let ev = single_event(json!({
            "choices": [{
                "delta": {
                    "tool_calls": [{
                        "index": 2,
                        "id": "call_xyz",
                        "function": {"name": "read_file", "arguments": ""}
                    }]
                }
            }]
        }));
        assert!(matches!(
            ev,
            ResponseEvent::ToolCallDelta { index: 2, ref id, ref name, .. }
                if id == "call_xyz" && name == "read_file"
        ));
    }

    #[test]
    fn parse_multiple_tool_calls_in_one_chunk() {
        let events = parse_sse_chunk(&json!({
            "choices": [{
                "delta": {
                    "tool_calls": [
                        {"index": 0, "id": "c0", "function": {"name": "a", "arguments": ""}},
                        {"index": 1, "id": "c1", "function": {"name": "b", "arguments": ""}},
                    ]
                }
            }]
        }));
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn parse_usage_chunk() {
        let ev = single_event(json!({
            "usage": {
                "prompt_tokens": 200,
                "completion_tokens": 40,
                "total_tokens": 240,
                "prompt_tokens_details": {"cached_tokens": 150}
            }
        }));
        match ev {
            ResponseEvent::Usage(u) => {
                assert_eq!(u.prompt_tokens, 200);
                assert_eq!(u.completion_tokens, 40);
                assert_eq!(u.total_tokens, 240);
                assert_eq!(u.cached_tokens, 150);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn parse_deepseek_cache_hit_tokens_at_root() {
        let ev = single_event(json!({
            "usage": {
                "prompt_tokens": 500,
                "completion_tokens": 30,
                "prompt_cache_hit_tokens": 400
            }
        }));
        assert!(matches!(ev, ResponseEvent::Usage(u) if u.cached_tokens == 400));
    }

    #[test]
    fn parse_finish_reason_chunk() {
        let events = parse_sse_chunk(&json!({
            "choices": [{"finish_reason": "stop", "delta": {}}]
        }));
        assert!(events
            .iter()
            .any(|e| matches!(e, Ok(ResponseEvent::Finish(FinishReason::Stop)))));
    }

    #[test]
    fn null_usage_falls_through_to_delta() {
        let ev = single_event(json!({
            "usage": null,
            "choices": [{"delta": {"content": "hi"}}]
        }));
        assert!(matches!(ev, ResponseEvent::TextDelta(t) if t == "hi"));
    }

    // ── SSE line-buffer reassembly ────────────────────────────────────────────

    #[test]
    fn drain_handles_single_complete_line() {
        let mut buf = "data: {\"choices\":[{\"delta\":{\"content\":\"hi\"}}]}\n".to_string();
        let events = drain_complete_sse_lines(&mut buf);
        assert_eq!(events.len(), 1);
        assert!(buf.is_empty());
    }

    #[test]
    fn drain_retains_incomplete_last_line() {
        let partial = "data: {\"choices\":[{\"delta\":{\"content\":\"hel";
        let mut buf = partial.to_string();
        let events = drain_complete_sse_lines(&mut buf);
        assert!(events.is_empty());
        assert_eq!(buf, partial);
    }

    #[test]
    fn sse_event_split_across_two_chunks_is_parsed() {
        let full = r#"data: {"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_1","function":{"name":"shell_command","arguments":""}}]}}]}"#;
        let split = full.len() / 2;
        let mut buf = String::new();

        buf.push_str(&full[..split]);
        assert!(drain_complete_sse_lines(&mut buf).is_empty());

        buf.push_str(&full[split..]);
        buf.push('\n');
        let events = drain_complete_sse_lines(&mut buf);
        assert_eq!(events.len(), 1);
        match &events[0] {
            Ok(ResponseEvent::ToolCallDelta { id, name, .. }) => {
                assert_eq!(id, "call_1");
                assert_eq!(name, "shell_command");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn done_sentinel_parsed() {
        let mut buf = "data: [DONE]\n".to_string();
        let events = drain_complete_sse_lines(&mut buf);
        assert!(matches!(events[0], Ok(ResponseEvent::Done)));
    }

    #[test]
    fn crlf_line_endings_handled() {
        let mut buf = "data: {\"choices\":[{\"delta\":{\"content\":\"hi\"}}]}\r\n".to_string();
        let events = drain_complete_sse_lines(&mut buf);
        assert_eq!(events.len(), 1);
    }

    // ── Wire message serialization ────────────────────────────────────────────

    #[test]
    fn plain_messages_serialize_role_and_content() {
        let wire = build_wire_messages(&[Message::user("hello")]);
        assert_eq!(wire[0]["role"], "user");
        assert_eq!(wire[0]["content"], "hello");
        assert!(wire[0].get("tool_calls").is_none());
    }

    #[test]
    fn assistant_tool_calls_serialize_as_array() {
        let wire = build_wire_messages(&[Message::assistant_with_tools(
            "",
            vec![
                crate::ToolCall::new("c1", "read_file", r#"{"path":"a"}"#),
                crate::ToolCall::new("c2", "read_file", r#"{"path":"b"}"#),
            ],
        )]);
        let calls = wire[0]["tool_calls"].as_array().unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0]["id"], "c1");
        assert_eq!(calls[1]["function"]["arguments"], r#"{"path":"b"}"#);
    }

    #[test]
    fn tool_message_carries_tool_call_id() {
        let wire = build_wire_messages(&[Message::tool_result("c1", "output")]);
        assert_eq!(wire[0]["role"], "tool");
        assert_eq!(wire[0]["tool_call_id"], "c1");
        assert_eq!(wire[0]["content"], "output");
    }

    // ── Non-streaming response parsing ────────────────────────────────────────

    #[test]
    fn full_response_yields_same_event_vocabulary() {
        let body = json!({
            "choices": [{
                "message": {
                    "content": "done",
                    "tool_calls": [
                        {"id": "c1", "function": {"name": "read_file", "arguments": "{}"}}
                    ]
                },
                "finish_reason": "tool_calls"
            }],
            "usage": {"prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15}
        });
        let events = parse_full_response(&body);
        assert!(events.iter().any(|e| matches!(e, ResponseEvent::TextDelta(t) if t == "done")));
        assert!(events
            .iter()
            .any(|e| matches!(e, ResponseEvent::ToolCallDelta { id, .. } if id == "c1")));
        assert!(events
            .iter()
            .any(|e| matches!(e, ResponseEvent::Finish(FinishReason::ToolCalls))));
        assert!(matches!(events.last(), Some(ResponseEvent::Done)));
    }
}
