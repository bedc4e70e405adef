// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Streaming API client with layered timeouts and retry.
//!
//! The client owns one request at a time.  A background task drives the
//! provider's event stream into a bounded channel while the supervisor
//! selects over chunk arrival, the first-chunk timer, the inter-chunk
//! timer, the overall deadline, and the per-query cancellation token.
//! Every text delta is ANSI-sanitized before it reaches the streaming
//! buffer or the caller's callback.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

use ledit_config::ProviderPolicy;

use crate::{
    cancel::CancelToken,
    error::{classify, ApiError, TimeoutBudget},
    retry::{RateLimitState, RetryConfig},
    sanitize::strip_ansi,
    ChatProvider, ChatRequest, ChatResponse, FinishReason, Message, ResponseEvent, ToolCall,
    ToolSchema, Usage,
};

/// Bounded chunk-notification channel between the request task and the
/// supervisor.  Backpressure here is harmless: the provider stream simply
/// pauses until the supervisor drains.
const CHUNK_CHANNEL_CAPACITY: usize = 64;

pub struct ApiClient {
    provider: Arc<dyn ChatProvider>,
    policy: ProviderPolicy,
    retry: RetryConfig,
    rate_limit: Mutex<RateLimitState>,
}

impl ApiClient {
    pub fn new(provider: Arc<dyn ChatProvider>, policy: ProviderPolicy) -> Self {
        Self {
            provider,
            policy,
            retry: RetryConfig::default(),
            rate_limit: Mutex::new(RateLimitState::default()),
        }
    }

    pub fn with_retry_config(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn provider_name(&self) -> &str {
        self.provider.provider()
    }

    pub fn model_name(&self) -> &str {
        self.provider.model()
    }

    pub fn policy(&self) -> &ProviderPolicy {
        &self.policy
    }

    /// Issue a chat request with retry and backoff.
    ///
    /// `on_chunk` receives each sanitized text delta in arrival order.
    /// Transient transport errors are retried with exponential backoff and
    /// jitter; rate limits run on their own schedule and attempt accounting;
    /// timeouts, 502s, auth and protocol faults surface immediately.
    pub async fn send_with_retry<F>(
        &self,
        messages: &[Message],
        tools: &[ToolSchema],
        reasoning_effort: Option<String>,
        cancel: &CancelToken,
        mut on_chunk: F,
    ) -> Result<ChatResponse, ApiError>
    where
        F: FnMut(&str),
    {
        self.rate_limit.lock().unwrap().reset();
        let mut transient_attempt: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(ApiError::Cancelled);
            }

            match self
                .send_once(messages, tools, reasoning_effort.clone(), cancel, &mut on_chunk)
                .await
            {
                Ok(resp) => {
                    self.record_response(&resp);
                    return Ok(resp);
                }
                Err(ApiError::RateLimited { retry_after }) => {
                    let (attempts, delay) = {
                        let mut rl = self.rate_limit.lock().unwrap();
                        let delay = rl.record(retry_after);
                        (rl.attempt_count, delay)
                    };
                    if attempts > self.retry.max_retries {
                        return Err(ApiError::RateLimitExceeded {
                            attempts,
                            last_error: format!(
                                "{} rate limited{}",
                                self.provider.provider(),
                                retry_after
                                    .map(|d| format!(", retry-after {}s", d.as_secs()))
                                    .unwrap_or_default()
                            ),
                        });
                    }
                    warn!(
                        provider = %self.provider.provider(),
                        attempt = attempts,
                        delay_secs = delay.as_secs(),
                        "rate limited; backing off"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(ApiError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) if e.is_retryable() && transient_attempt < self.retry.max_retries => {
                    let delay = self.retry.delay_for(transient_attempt);
                    transient_attempt += 1;
                    warn!(
                        provider = %self.provider.provider(),
                        attempt = transient_attempt,
                        max = self.retry.max_retries,
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "transient transport error; retrying"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(ApiError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn send_once<F>(
        &self,
        messages: &[Message],
        tools: &[ToolSchema],
        reasoning_effort: Option<String>,
        cancel: &CancelToken,
        on_chunk: &mut F,
    ) -> Result<ChatResponse, ApiError>
    where
        F: FnMut(&str),
    {
        let timeouts = &self.policy.timeouts;
        let overall_deadline = Instant::now() + timeouts.overall();

        let req = ChatRequest {
            messages: messages.to_vec(),
            tools: tools.to_vec(),
            reasoning_effort,
            stream: self.policy.streaming_enabled(),
        };

        // Connection phase: establishing transport and receiving response
        // headers must complete within the connect budget.
        let stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ApiError::Cancelled),
            result = tokio::time::timeout(timeouts.connect(), self.provider.complete(req)) => {
                match result {
                    Err(_) => {
                        return Err(ApiError::Timeout {
                            budget: TimeoutBudget::Connect,
                            detail: format!(
                                "could not reach {} within {}s",
                                self.provider.provider(),
                                timeouts.connect().as_secs()
                            ),
                        })
                    }
                    Ok(Err(e)) => return Err(classify(&format!("{e:#}"))),
                    Ok(Ok(s)) => s,
                }
            }
        };

        // Background task feeds chunks through a bounded channel so the
        // supervisor can watch timers while the provider stream is idle.
        let (tx, mut rx) = mpsc::channel::<anyhow::Result<ResponseEvent>>(CHUNK_CHANNEL_CAPACITY);
        let pump = tokio::spawn(async move {
            let mut stream = stream;
            while let Some(item) = stream.next().await {
                if tx.send(item).await.is_err() {
                    // Supervisor gave up (timeout or cancel); stop pumping.
                    break;
                }
            }
        });

        let result = self
            .supervise(&mut rx, overall_deadline, cancel, on_chunk)
            .await;
        pump.abort();
        result
    }

    /// The streaming select loop: one iteration per chunk or timer event.
    async fn supervise<F>(
        &self,
        rx: &mut mpsc::Receiver<anyhow::Result<ResponseEvent>>,
        overall_deadline: Instant,
        cancel: &CancelToken,
        on_chunk: &mut F,
    ) -> Result<ChatResponse, ApiError>
    where
        F: FnMut(&str),
    {
        let timeouts = &self.policy.timeouts;
        let mut acc = StreamAccumulator::default();
        let mut first_chunk_seen = false;
        // The first-chunk budget applies until the first event arrives,
        // after which the (shorter) inter-chunk budget takes over.
        let mut quiet_deadline = Instant::now() + timeouts.first_chunk();

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ApiError::Cancelled),
                _ = tokio::time::sleep_until(overall_deadline) => {
                    return Err(ApiError::Timeout {
                        budget: TimeoutBudget::Overall,
                        detail: format!(
                            "request exceeded the overall budget of {}s",
                            timeouts.overall().as_secs()
                        ),
                    });
                }
                _ = tokio::time::sleep_until(quiet_deadline) => {
                    return Err(if first_chunk_seen {
                        ApiError::Timeout {
                            budget: TimeoutBudget::Chunk,
                            detail: format!(
                                "stream went silent for {}s between chunks",
                                timeouts.chunk().as_secs()
                            ),
                        }
                    } else {
                        ApiError::Timeout {
                            budget: TimeoutBudget::FirstChunk,
                            detail: format!(
                                "no response received within {}s",
                                timeouts.first_chunk().as_secs()
                            ),
                        }
                    });
                }
                item = rx.recv() => {
                    match item {
                        None => return Ok(acc.finish()),
                        Some(Err(e)) => return Err(classify(&format!("{e:#}"))),
                        Some(Ok(event)) => {
                            first_chunk_seen = true;
                            quiet_deadline = Instant::now() + timeouts.chunk();
                            if let Some(done) = acc.apply(event, on_chunk) {
                                return Ok(done);
                            }
                        }
                    }
                }
            }
        }
    }

    /// Persist debugging copies of the response and log usage.
    fn record_response(&self, resp: &ChatResponse) {
        debug!(
            provider = %self.provider.provider(),
            model = %self.provider.model(),
            prompt_tokens = resp.usage.prompt_tokens,
            completion_tokens = resp.usage.completion_tokens,
            cached_tokens = resp.usage.cached_tokens,
            finish = ?resp.finish_reason,
            "completion finished"
        );

        let body = serde_json::json!({
            "provider": self.provider.provider(),
            "model": self.provider.model(),
            "content": resp.content,
            "reasoning_content": resp.reasoning_content,
            "tool_calls": resp.tool_calls,
            "usage": resp.usage,
        });
        let dir = ledit_config::env::state_dir();
        // Best-effort: debugging dumps never fail the request.
        if std::fs::create_dir_all(&dir).is_ok() {
            let pretty = serde_json::to_string_pretty(&body).unwrap_or_default();
            if let Err(e) = std::fs::write(dir.join("lastResponse.json"), &pretty) {
                debug!("could not persist lastResponse.json: {e}");
            }
            if ledit_config::env::log_api_responses() {
                let ts = chrono::Utc::now().format("%Y%m%dT%H%M%S%.3f");
                let path = dir.join(format!("api_response_{ts}.json"));
                if let Err(e) = std::fs::write(&path, &pretty) {
                    debug!("could not dump api response: {e}");
                }
            }
        }
    }
}

// ─── Stream accumulation ──────────────────────────────────────────────────────

/// Assembles streamed events into one [`ChatResponse`].
#[derive(Default)]
struct StreamAccumulator {
    text: String,
    reasoning: String,
    pending_tool_calls: HashMap<u32, PendingToolCall>,
    finish_reason: FinishReason,
    usage: Usage,
}

#[derive(Default)]
struct PendingToolCall {
    id: String,
    name: String,
    arguments: String,
}

impl StreamAccumulator {
    /// Apply one event.  Returns the finished response on `Done`.
    fn apply<F>(&mut self, event: ResponseEvent, on_chunk: &mut F) -> Option<ChatResponse>
    where
        F: FnMut(&str),
    {
        match event {
            ResponseEvent::TextDelta(delta) => {
                let clean = strip_ansi(&delta);
                if !clean.is_empty() {
                    on_chunk(&clean);
                    self.text.push_str(&clean);
                }
            }
            ResponseEvent::ReasoningDelta(delta) => {
                self.reasoning.push_str(&strip_ansi(&delta));
            }
            ResponseEvent::ToolCallDelta {
                index,
                id,
                name,
                arguments,
            } => {
                let pending = self.pending_tool_calls.entry(index).or_default();
                if !id.is_empty() {
                    pending.id = id;
                }
                if !name.is_empty() {
                    pending.name = name;
                }
                pending.arguments.push_str(&arguments);
            }
            ResponseEvent::Usage(u) => self.usage = u,
            ResponseEvent::Finish(reason) => {
                if reason != FinishReason::None {
                    self.finish_reason = reason;
                }
            }
            ResponseEvent::Error(e) => {
                if !e.is_empty() {
                    warn!("in-stream provider warning: {e}");
                }
            }
            ResponseEvent::Done => return Some(std::mem::take(self).finish()),
        }
        None
    }

    fn finish(self) -> ChatResponse {
        // Flush accumulated parallel tool calls ordered by provider index.
        // Calls with an empty name cannot be dispatched and are dropped;
        // empty ids are left for the orchestrator's id synthesis.
        let mut pending: Vec<(u32, PendingToolCall)> =
            self.pending_tool_calls.into_iter().collect();
        pending.sort_by_key(|(idx, _)| *idx);
        let tool_calls: Vec<ToolCall> = pending
            .into_iter()
            .filter_map(|(_, p)| {
                if p.name.is_empty() {
                    warn!(tool_call_id = %p.id, "dropping tool call with empty name");
                    return None;
                }
                Some(ToolCall {
                    id: p.id,
                    name: p.name,
                    arguments: p.arguments,
                })
            })
            .collect();

        let finish_reason = if self.finish_reason == FinishReason::None && !tool_calls.is_empty() {
            FinishReason::ToolCalls
        } else {
            self.finish_reason
        };

        ChatResponse {
            content: self.text,
            reasoning_content: if self.reasoning.is_empty() {
                None
            } else {
                Some(self.reasoning)
            },
            tool_calls,
            finish_reason,
            usage: self.usage,
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
