// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream;
use futures::StreamExt;

use crate::{
    provider::ResponseStream, ChatRequest, FinishReason, ResponseEvent, Role, Usage,
};

/// Deterministic mock provider for tests.  Echoes the last user message back
/// as the assistant response.
#[derive(Default)]
pub struct MockProvider;

#[async_trait]
impl crate::ChatProvider for MockProvider {
    fn provider(&self) -> &str {
        "mock"
    }
    fn model(&self) -> &str {
        "mock-model"
    }

    async fn complete(&self, req: ChatRequest) -> anyhow::Result<ResponseStream> {
        let reply = req
            .messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.clone())
            .unwrap_or_else(|| "[no input]".into());

        let events: Vec<anyhow::Result<ResponseEvent>> = vec![
            Ok(ResponseEvent::TextDelta(format!("MOCK: {reply}"))),
            Ok(ResponseEvent::Finish(FinishReason::Stop)),
            Ok(ResponseEvent::Usage(Usage {
                prompt_tokens: 10,
                completion_tokens: 10,
                total_tokens: 20,
                ..Default::default()
            })),
            Ok(ResponseEvent::Done),
        ];
        Ok(Box::pin(stream::iter(events)))
    }
}

/// A single scripted model turn: the events to emit, an optional artificial
/// delay before the first event, and an optional pre-stream error.
pub enum Script {
    Events(Vec<ResponseEvent>),
    /// Emit the events after waiting; used to exercise timeout budgets.
    DelayedEvents(Duration, Vec<ResponseEvent>),
    /// Fail the request before any event is produced.
    Error(String),
    /// Accept the request but never produce a byte.
    Silence,
    /// Emit the events, then stall without closing the stream.
    EventsThenSilence(Vec<ResponseEvent>),
}

/// A pre-scripted provider.  Each `complete` call pops the next script from
/// the front of the queue, so tests can specify exact multi-turn sequences —
/// including tool calls and failures — without network access.
pub struct ScriptedMockProvider {
    scripts: Arc<Mutex<Vec<Script>>>,
    name: String,
    /// The last request seen, for assertions on what was sent.
    pub last_request: Arc<Mutex<Option<ChatRequest>>>,
    /// Number of `complete` calls made so far.
    pub call_count: Arc<Mutex<u32>>,
}

impl ScriptedMockProvider {
    pub fn new(scripts: Vec<Script>) -> Self {
        Self {
            scripts: Arc::new(Mutex::new(scripts)),
            name: "scripted-mock".into(),
            last_request: Arc::new(Mutex::new(None)),
            call_count: Arc::new(Mutex::new(0)),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Convenience: a text reply that terminates with `stop`.
    pub fn text_turn(text: impl Into<String>) -> Script {
        Script::Events(vec![
            ResponseEvent::TextDelta(text.into()),
            ResponseEvent::Finish(FinishReason::Stop),
            ResponseEvent::Usage(Usage {
                prompt_tokens: 5,
                completion_tokens: 5,
                total_tokens: 10,
                ..Default::default()
            }),
            ResponseEvent::Done,
        ])
    }

    /// Convenience: a turn consisting of structured tool calls.
    pub fn tool_turn(calls: Vec<(&str, &str, &str)>) -> Script {
        let mut events: Vec<ResponseEvent> = calls
            .iter()
            .enumerate()
            .map(|(i, (id, name, args))| ResponseEvent::ToolCallDelta {
                index: i as u32,
                id: id.to_string(),
                name: name.to_string(),
                arguments: args.to_string(),
            })
            .collect();
        events.push(ResponseEvent::Finish(FinishReason::ToolCalls));
        events.push(ResponseEvent::Done);
        Script::Events(events)
    }

    /// Convenience: provider that always fails with the given error text.
    pub fn always_error(msg: impl Into<String>) -> Self {
        let msg = msg.into();
        Self::new(
            std::iter::repeat_with(|| Script::Error(msg.clone()))
                .take(16)
                .collect(),
        )
    }
}

#[async_trait]
impl crate::ChatProvider for ScriptedMockProvider {
    fn provider(&self) -> &str {
        &self.name
    }
    fn model(&self) -> &str {
        "scripted-mock-model"
    }

    async fn complete(&self, req: ChatRequest) -> anyhow::Result<ResponseStream> {
        *self.last_request.lock().unwrap() = Some(req);
        *self.call_count.lock().unwrap() += 1;

        let script = {
            let mut scripts = self.scripts.lock().unwrap();
            if scripts.is_empty() {
                Script::Events(vec![
                    ResponseEvent::TextDelta("[no more scripts]".into()),
                    ResponseEvent::Finish(FinishReason::Stop),
                    ResponseEvent::Done,
                ])
            } else {
                scripts.remove(0)
            }
        };

        match script {
            Script::Events(events) => {
                let wrapped: Vec<anyhow::Result<ResponseEvent>> =
                    events.into_iter().map(Ok).collect();
                Ok(Box::pin(stream::iter(wrapped)))
            }
            Script::DelayedEvents(delay, events) => {
                // Sleep before the first event only; the rest flow freely.
                let s = stream::unfold(
                    (delay, events.into_iter()),
                    |(delay, mut rest)| async move {
                        if !delay.is_zero() {
                            tokio::time::sleep(delay).await;
                        }
                        rest.next()
                            .map(|ev| (Ok::<_, anyhow::Error>(ev), (Duration::ZERO, rest)))
                    },
                );
                Ok(Box::pin(s))
            }
            Script::Error(msg) => Err(anyhow::anyhow!(msg)),
            Script::Silence => {
                let s = stream::once(async {
                    futures::future::pending::<()>().await;
                    Ok::<_, anyhow::Error>(ResponseEvent::Done)
                });
                Ok(Box::pin(s))
            }
            Script::EventsThenSilence(events) => {
                let wrapped: Vec<anyhow::Result<ResponseEvent>> =
                    events.into_iter().map(Ok).collect();
                let head = stream::iter(wrapped);
                let tail = stream::once(async {
                    futures::future::pending::<()>().await;
                    Ok::<_, anyhow::Error>(ResponseEvent::Done)
                });
                Ok(Box::pin(head.chain(tail)))
            }
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
