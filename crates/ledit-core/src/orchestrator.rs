// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The conversation orchestrator.
//!
//! One `process_query` call runs the full iteration loop: compose a
//! bounded prompt, call the model, parse the response, execute tools,
//! re-enter.  The engine owns the transcript exclusively; the client and
//! the executor receive snapshots and capability handles only.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use regex::Regex;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use ledit_config::Config;
use ledit_model::{
    ApiClient, ApiError, CancelToken, ChatProvider, FinishReason, Message, Role, ToolCall,
    ToolSchema, Usage,
};
use ledit_tools::{parse_arguments, ToolExecutor, ToolInvocation, ToolRegistry};

use crate::{
    context,
    events::EngineEvent,
    interrupt::{InactivityWatchdog, InputInjector, InterruptHandle},
    prompts,
    transcript::Transcript,
    turnlog::{TurnEvaluation, TurnLogger},
};

/// Context window assumed when the model config does not specify one.
const DEFAULT_CONTEXT_TOKENS: usize = 128_000;

/// Length of the prefix compared when checking for a repeated answer.
const REPETITION_PREFIX: usize = 80;

#[derive(Debug, Error)]
pub enum EngineError {
    /// A client failure in CI mode; `message` carries the progress summary.
    #[error("{message}")]
    Api {
        message: String,
        #[source]
        source: ApiError,
    },
    #[error("model produced two consecutive empty responses (iteration {iteration})")]
    EmptyResponses { iteration: u32 },
    #[error("iteration budget of {budget} exhausted without completion ({progress})")]
    BudgetExceeded { budget: u32, progress: String },
    #[error("response blocked by provider content filter")]
    ContentFiltered,
    #[error("query cancelled")]
    Cancelled,
}

pub struct Engine {
    client: ApiClient,
    executor: ToolExecutor,
    transcript: Transcript,
    config: Config,
    system_prompt: String,
    max_context_tokens: usize,
    interrupt: InterruptHandle,
    injector: InputInjector,
    events_tx: mpsc::UnboundedSender<EngineEvent>,
    events_rx: Option<mpsc::UnboundedReceiver<EngineEvent>>,
    turn_logger: TurnLogger,
    session_usage: Usage,
    tools_executed: u64,
    /// The model has used a structured todo tool this session, which marks
    /// the query as a long-running task for budgeting purposes.
    used_todo_tool: bool,
    /// Monotonic per-query counter for synthesized tool-call ids.
    call_counter: u64,
}

impl Engine {
    pub fn new(
        provider: Arc<dyn ChatProvider>,
        registry: Arc<ToolRegistry>,
        config: Config,
    ) -> Self {
        let policy = config.policy_for(provider.provider());
        let client = ApiClient::new(provider, policy).with_retry_config(
            ledit_model::RetryConfig {
                max_retries: config.agent.max_retries,
                ..Default::default()
            },
        );
        let executor = ToolExecutor::new(
            registry,
            config.agent.circuit_breaker_threshold,
            Duration::from_secs(config.agent.circuit_breaker_window_secs),
        );
        let system_prompt = prompts::system_prompt(config.agent.system_prompt.as_deref());
        let max_context_tokens = config
            .model
            .max_context_tokens
            .unwrap_or(DEFAULT_CONTEXT_TOKENS);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            client,
            executor,
            transcript: Transcript::new(),
            config,
            system_prompt,
            max_context_tokens,
            interrupt: InterruptHandle::new(),
            injector: InputInjector::new(),
            events_tx,
            events_rx: Some(events_rx),
            turn_logger: TurnLogger::from_env(),
            session_usage: Usage::default(),
            tools_executed: 0,
            used_todo_tool: false,
            call_counter: 0,
        }
    }

    /// Receiver for engine events.  Take it once, before the first query.
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<EngineEvent>> {
        self.events_rx.take()
    }

    /// Handle a UI can use to interrupt the running query.
    pub fn interrupt_handle(&self) -> InterruptHandle {
        self.interrupt.clone()
    }

    /// Sender for mid-query user input injection.
    pub fn input_sender(&self) -> mpsc::UnboundedSender<String> {
        self.injector.sender()
    }

    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    pub fn session_usage(&self) -> Usage {
        self.session_usage
    }

    pub fn clear_history(&mut self) {
        self.transcript.clear();
        self.used_todo_tool = false;
    }

    /// Run the main loop for one user query.
    ///
    /// Returns the model's final answer with the completion sentinel
    /// stripped.  In interactive mode client failures return a
    /// conversation-preserved notice instead of an error; in CI mode they
    /// terminate with a progress summary.
    pub async fn process_query(&mut self, user_query: &str) -> Result<String, EngineError> {
        // Fresh cancellation context per query; the long-lived interrupt
        // handle is bridged onto it for this query only.
        let cancel = CancelToken::new();
        let _bridge = self.interrupt.bridge_to(cancel.clone());
        let watchdog = InactivityWatchdog::arm(
            Duration::from_secs(self.config.agent.inactivity_timeout_secs),
            cancel.clone(),
        );

        self.executor.reset_breaker();
        self.call_counter = 0;
        self.transcript.push(Message::user(user_query));

        let strict_alternation = self.client.policy().strict_role_alternation();
        let requires_explicit_completion = self.client.policy().requires_explicit_completion();
        let supports_effort = self.client.policy().supports_reasoning_effort();

        let mut iteration: u32 = 0;
        let mut consecutive_blanks: u32 = 0;
        let mut prev_assistant_prefix: Option<String> = None;
        let mut repetition_reminder_sent = false;
        let mut completion_reminder_sent = false;

        loop {
            if cancel.is_cancelled() {
                return self.surface_cancelled();
            }

            // Mid-query input injection: append and re-enter without a
            // model call.
            let injected = self.injector.try_drain();
            if !injected.is_empty() {
                for text in injected {
                    debug!("injecting mid-query user input");
                    self.transcript.push(Message::user(text));
                }
                continue;
            }

            iteration += 1;
            let budget = self.iteration_budget();
            if iteration > budget {
                self.emit(EngineEvent::QueryComplete);
                return Err(EngineError::BudgetExceeded {
                    budget,
                    progress: self.progress_summary(iteration),
                });
            }

            // Compose the bounded outbound prompt.
            let outbound = self.compose_outbound(strict_alternation);
            let schemas: Vec<ToolSchema> = self.executor.registry().schemas();
            // Effort tracks the latest user message, so an injected
            // follow-up can raise or lower it mid-query.
            let effort = if supports_effort {
                let last_user = self
                    .transcript
                    .messages()
                    .iter()
                    .rev()
                    .find(|m| m.role == Role::User)
                    .map(|m| m.content.as_str())
                    .unwrap_or(user_query);
                Some(reasoning_effort(last_user).to_string())
            } else {
                None
            };

            let marker = watchdog.marker();
            let tx = self.events_tx.clone();
            let result = self
                .client
                .send_with_retry(&outbound, &schemas, effort, &cancel, move |chunk| {
                    marker.mark();
                    let _ = tx.send(EngineEvent::TextDelta(chunk.to_string()));
                })
                .await;

            let resp = match result {
                Ok(resp) => resp,
                Err(ApiError::Cancelled) => return self.surface_cancelled(),
                Err(e) => return self.surface_client_error(e, iteration),
            };
            watchdog.mark();
            self.session_usage.accumulate(&resp.usage);
            self.emit(EngineEvent::TokenUsage {
                turn: resp.usage,
                session: self.session_usage,
            });

            let mut eval = TurnEvaluation::new(iteration);
            if iteration == 1 {
                eval.user_input = Some(user_query.to_string());
            }
            eval.finish_reason = finish_reason_str(resp.finish_reason).to_string();
            eval.token_usage = resp.usage;
            eval.reasoning_snippet = resp
                .reasoning_content
                .as_deref()
                .map(|r| r.chars().take(200).collect());

            // Assemble the assistant message: dedupe structured calls, then
            // try fallback recovery when a tool-less turn looks like one.
            let mut content = resp.content.clone();
            let mut tool_calls = self.dedupe_and_identify(resp.tool_calls.clone());
            if tool_calls.is_empty() {
                if let Some((cleaned, recovered)) = self.try_fallback(&content) {
                    eval.tool_logs
                        .push(format!("fallback parser recovered {} call(s)", recovered.len()));
                    content = cleaned;
                    tool_calls = recovered;
                }
            }

            if !content.trim().is_empty() || !tool_calls.is_empty() {
                self.transcript.push(Message {
                    role: ledit_model::Role::Assistant,
                    content: content.clone(),
                    reasoning_content: resp.reasoning_content.clone(),
                    tool_calls: tool_calls.clone(),
                    tool_call_id: None,
                });
            }
            if !content.trim().is_empty() {
                self.emit(EngineEvent::TextComplete(content.clone()));
            }
            eval.assistant_content = content.clone();
            eval.tool_calls = tool_calls
                .iter()
                .map(|tc| format!("{}({})", tc.name, tc.id))
                .collect();

            // Tool execution round.
            if !tool_calls.is_empty() {
                let outcomes = self.run_tools(&tool_calls, &cancel).await;
                watchdog.mark();
                for outcome in &outcomes {
                    eval.tool_results
                        .push(outcome.content.chars().take(80).collect());
                }
                self.turn_logger.append(&eval);

                if cancel.is_cancelled() {
                    return self.surface_cancelled();
                }
                // Optional execution summary for providers that tolerate a
                // user message between tool results and the next turn.
                if !strict_alternation {
                    let names: Vec<&str> =
                        tool_calls.iter().map(|tc| tc.name.as_str()).collect();
                    self.transcript.push(Message::user(format!(
                        "[{} tool call(s) executed: {}. Continue with the task.]",
                        names.len(),
                        names.join(", ")
                    )));
                }
                prev_assistant_prefix = None;
                continue;
            }

            // Terminal-condition ladder.
            let blank = content.trim().is_empty();
            if blank {
                consecutive_blanks += 1;
                eval.guardrail_trigger = Some("blank_iteration".into());
                self.turn_logger.append(&eval);
                if consecutive_blanks >= 2 {
                    self.emit(EngineEvent::QueryComplete);
                    return Err(EngineError::EmptyResponses { iteration });
                }
                continue;
            }
            consecutive_blanks = 0;

            let prefix: String = content.chars().take(REPETITION_PREFIX).collect();
            if prev_assistant_prefix.as_deref() == Some(prefix.as_str())
                && !repetition_reminder_sent
            {
                repetition_reminder_sent = true;
                eval.guardrail_trigger = Some("repetitive_content".into());
                self.turn_logger.append(&eval);
                self.remind(
                    "You are repeating your previous answer. Take a different action, \
                     or finish with [[TASK_COMPLETE]] if the task is done.",
                );
                continue;
            }
            prev_assistant_prefix = Some(prefix);

            let (stripped, sentinel_found) = strip_completion_sentinel(&content);
            if sentinel_found {
                eval.completion_reached = true;
                self.turn_logger.append(&eval);
                return Ok(self.finish_query(stripped));
            }

            match resp.finish_reason {
                FinishReason::Stop => {
                    if requires_explicit_completion {
                        if !completion_reminder_sent {
                            completion_reminder_sent = true;
                            eval.guardrail_trigger = Some("missing_completion_sentinel".into());
                            self.turn_logger.append(&eval);
                            self.remind(
                                "If the task is complete, restate your final answer ending \
                                 with [[TASK_COMPLETE]]. Otherwise continue working.",
                            );
                            continue;
                        }
                        // Second bare stop: accept it rather than looping.
                        eval.completion_reached = true;
                        self.turn_logger.append(&eval);
                        return Ok(self.finish_query(stripped));
                    }
                    eval.completion_reached = true;
                    self.turn_logger.append(&eval);
                    return Ok(self.finish_query(stripped));
                }
                FinishReason::Length => {
                    eval.guardrail_trigger = Some("length_cutoff".into());
                    self.turn_logger.append(&eval);
                    self.remind(
                        "Your last response was cut off by the output limit. \
                         Continue from where you stopped.",
                    );
                    continue;
                }
                FinishReason::ContentFilter => {
                    self.turn_logger.append(&eval);
                    self.emit(EngineEvent::QueryComplete);
                    return Err(EngineError::ContentFiltered);
                }
                FinishReason::ToolCalls | FinishReason::None => {
                    self.turn_logger.append(&eval);
                    continue;
                }
            }
        }
    }

    // ── Loop helpers ─────────────────────────────────────────────────────────

    fn iteration_budget(&self) -> u32 {
        if self.used_todo_tool {
            self.config.agent.task_iteration_budget
        } else {
            self.config.agent.question_iteration_budget
        }
    }

    fn compose_outbound(&self, strict_alternation: bool) -> Vec<Message> {
        let snapshot = self
            .transcript
            .snapshot(&self.system_prompt, strict_alternation);
        let reshaped = if self.config.agent.optimizer_enabled {
            context::optimize(snapshot)
        } else {
            snapshot
        };
        let tokens_before = context::estimate_tokens(&reshaped);
        let pruned = context::prune(
            reshaped,
            self.max_context_tokens,
            self.config.agent.prune_trigger_fraction,
        );
        if pruned.dropped > 0 {
            self.emit(EngineEvent::ContextPruned {
                tokens_before,
                tokens_after: context::estimate_tokens(&pruned.messages),
                aggressive: pruned.aggressive,
            });
        }

        let mut outbound = Vec::with_capacity(pruned.messages.len() + 1);
        outbound.push(Message::system(self.system_prompt.clone()));
        outbound.extend(pruned.messages);
        context::maybe_log_breakdown(&outbound);
        outbound
    }

    /// Deduplicate tool calls by id and by `(name, trimmed arguments)`,
    /// keeping first occurrences, and synthesize ids for calls that
    /// arrived without one.
    fn dedupe_and_identify(&mut self, calls: Vec<ToolCall>) -> Vec<ToolCall> {
        let mut seen_ids = std::collections::HashSet::new();
        let mut seen_shapes = std::collections::HashSet::new();
        let mut out = Vec::with_capacity(calls.len());
        for mut tc in calls {
            if !tc.id.is_empty() && !seen_ids.insert(tc.id.clone()) {
                debug!(id = %tc.id, "dropping tool call with duplicate id");
                continue;
            }
            let shape = (tc.name.clone(), tc.arguments.trim().to_string());
            if !seen_shapes.insert(shape) {
                debug!(tool = %tc.name, "dropping duplicate tool call (same name and arguments)");
                continue;
            }
            if tc.id.is_empty() {
                self.call_counter += 1;
                tc.id = format!("call_{}_{}", tc.name, self.call_counter);
                warn!(tool = %tc.name, id = %tc.id, "tool call arrived without id; synthesized one");
                seen_ids.insert(tc.id.clone());
            }
            out.push(tc);
        }
        out
    }

    /// Attempt to recover tool calls from prose when the model skipped the
    /// structured protocol.  Returns the cleaned content and the recovered
    /// calls with synthesized ids.
    fn try_fallback(&mut self, content: &str) -> Option<(String, Vec<ToolCall>)> {
        let known = self.executor.registry().names();
        if !ledit_tools::looks_like_tool_attempt(content, &known) {
            return None;
        }
        let parsed = ledit_tools::parse_tool_calls(content, &known)?;
        let calls: Vec<ToolCall> = parsed
            .calls
            .into_iter()
            .map(|rc| {
                self.call_counter += 1;
                ToolCall::new(
                    format!("call_{}_{}", rc.name, self.call_counter),
                    rc.name,
                    rc.arguments.to_string(),
                )
            })
            .collect();
        warn!(count = calls.len(), "recovered tool calls via fallback parser");
        Some((parsed.cleaned_content, calls))
    }

    async fn run_tools(&mut self, tool_calls: &[ToolCall], cancel: &CancelToken) -> Vec<ledit_tools::ToolOutcome> {
        for tc in tool_calls {
            if tc.name.contains("todo") {
                self.used_todo_tool = true;
            }
            self.emit(EngineEvent::ToolCallStarted {
                call_id: tc.id.clone(),
                tool_name: tc.name.clone(),
                arguments: tc.arguments.clone(),
            });
        }
        let invocations: Vec<ToolInvocation> = tool_calls
            .iter()
            .map(|tc| ToolInvocation::new(&tc.id, &tc.name, parse_arguments(&tc.arguments)))
            .collect();
        let outcomes = self.executor.execute_batch(&invocations, cancel).await;
        for outcome in &outcomes {
            self.tools_executed += 1;
            self.transcript
                .push(Message::tool_result(&outcome.call_id, &outcome.content));
            self.emit(EngineEvent::ToolCallFinished {
                call_id: outcome.call_id.clone(),
                tool_name: outcome.name.clone(),
                output: outcome.content.clone(),
                is_error: outcome.is_error,
            });
        }
        outcomes
    }

    fn remind(&mut self, text: &str) {
        self.emit(EngineEvent::Reminder(text.to_string()));
        self.transcript.push(Message::user(text));
    }

    /// Commit a completed query: persist the stripped final message first,
    /// then collapse the prior turns into a summary.
    fn finish_query(&mut self, final_text: String) -> String {
        self.transcript
            .rewrite_last_assistant_content(final_text.clone());
        if self.config.agent.completion_summary_enabled {
            let summarized =
                context::summarize_completed_task(self.transcript.messages().to_vec());
            self.transcript.replace(summarized);
        }
        self.emit(EngineEvent::QueryComplete);
        final_text
    }

    fn progress_summary(&self, iterations: u32) -> String {
        format!(
            "{iterations} iteration(s), {} tool call(s), {} token(s) used",
            self.tools_executed, self.session_usage.total_tokens
        )
    }

    /// Interactive mode keeps the session alive with a classified notice;
    /// CI mode terminates with the progress summary attached.
    fn surface_client_error(
        &mut self,
        e: ApiError,
        iteration: u32,
    ) -> Result<String, EngineError> {
        if ledit_config::env::is_ci_mode() {
            self.emit(EngineEvent::QueryComplete);
            let message = format!("{e} ({})", self.progress_summary(iteration));
            return Err(EngineError::Api { message, source: e });
        }
        let notice = format!(
            "The request failed: {e}\n\
             The conversation has been preserved. You can retry, rephrase the request, \
             or switch models with --model <provider>/<name>."
        );
        // The notice never streamed as deltas; surface it through the event
        // channel so a streaming front-end displays it too.
        self.emit(EngineEvent::TextDelta(notice.clone()));
        self.emit(EngineEvent::QueryComplete);
        Ok(notice)
    }

    fn surface_cancelled(&mut self) -> Result<String, EngineError> {
        if ledit_config::env::is_ci_mode() {
            self.emit(EngineEvent::QueryComplete);
            return Err(EngineError::Cancelled);
        }
        let notice = "Query interrupted. The conversation has been preserved.".to_string();
        self.emit(EngineEvent::TextDelta(notice.clone()));
        self.emit(EngineEvent::QueryComplete);
        Ok(notice)
    }

    fn emit(&self, event: EngineEvent) {
        let _ = self.events_tx.send(event);
    }
}

// ─── Free helpers ─────────────────────────────────────────────────────────────

fn finish_reason_str(r: FinishReason) -> &'static str {
    match r {
        FinishReason::Stop => "stop",
        FinishReason::Length => "length",
        FinishReason::ToolCalls => "tool_calls",
        FinishReason::ContentFilter => "content_filter",
        FinishReason::None => "",
    }
}

/// Strip every occurrence of the completion sentinel.
///
/// The sentinel is matched case-insensitively with an underscore, a space,
/// or nothing between the two words.  Stripping a clean string is a no-op.
pub fn strip_completion_sentinel(text: &str) -> (String, bool) {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"(?i)\[\[\s*task[ _]?complete\s*\]\]").unwrap());
    if !re.is_match(text) {
        return (text.to_string(), false);
    }
    (re.replace_all(text, "").trim().to_string(), true)
}

/// Heuristic reasoning-effort from the user's phrasing: file and shell
/// verbs are mechanical, analysis verbs warrant deeper reasoning.
pub fn reasoning_effort(query: &str) -> &'static str {
    const HIGH: &[&str] = &[
        "analyze", "analyse", "design", "debug", "architect", "investigate", "refactor",
        "diagnose", "optimize", "optimise", "why",
    ];
    const LOW: &[&str] = &[
        "read", "cat", "show", "print", "list", "ls", "run", "open", "copy", "move", "rename",
        "delete", "mkdir", "touch",
    ];
    let lower = query.to_lowercase();
    let has = |words: &[&str]| {
        lower
            .split(|c: char| !c.is_alphanumeric() && c != '_')
            .any(|token| words.contains(&token))
    };
    if has(HIGH) {
        "high"
    } else if has(LOW) {
        "low"
    } else {
        "medium"
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    // ── Sentinel stripping ────────────────────────────────────────────────────

    #[test]
    fn sentinel_is_stripped_exactly() {
        let (text, found) =
            strip_completion_sentinel("The first line is: # Hello [[TASK_COMPLETE]]");
        assert!(found);
        assert_eq!(text, "The first line is: # Hello");
    }

    #[test]
    fn sentinel_variants_are_recognized() {
        for s in [
            "[[TASK_COMPLETE]]",
            "[[task_complete]]",
            "[[Task Complete]]",
            "[[TASKCOMPLETE]]",
            "[[ TASK_COMPLETE ]]",
        ] {
            let (_, found) = strip_completion_sentinel(&format!("done {s}"));
            assert!(found, "variant not recognized: {s}");
        }
    }

    #[test]
    fn stripping_clean_text_is_a_no_op() {
        let (text, found) = strip_completion_sentinel("no sentinel here");
        assert!(!found);
        assert_eq!(text, "no sentinel here");
    }

    #[test]
    fn multiple_sentinel_occurrences_all_removed() {
        let (text, found) =
            strip_completion_sentinel("[[TASK_COMPLETE]] answer [[task complete]]");
        assert!(found);
        assert_eq!(text, "answer");
    }

    // ── Reasoning effort ──────────────────────────────────────────────────────

    #[test]
    fn file_and_shell_verbs_are_low_effort() {
        assert_eq!(reasoning_effort("read the README file"), "low");
        assert_eq!(reasoning_effort("run the tests"), "low");
        assert_eq!(reasoning_effort("list all files in src"), "low");
    }

    #[test]
    fn analysis_verbs_are_high_effort() {
        assert_eq!(reasoning_effort("debug the race condition"), "high");
        assert_eq!(reasoning_effort("design a new cache layer"), "high");
        assert_eq!(reasoning_effort("why does this test fail"), "high");
    }

    #[test]
    fn high_wins_over_low_when_both_present() {
        assert_eq!(reasoning_effort("read the code and debug the crash"), "high");
    }

    #[test]
    fn everything_else_is_medium() {
        assert_eq!(reasoning_effort("add a retry to the client"), "medium");
    }

    #[test]
    fn effort_matches_whole_words_only() {
        // "thread" contains "read" but is not a read command.
        assert_eq!(reasoning_effort("fix the thread pool"), "medium");
    }

    // ── Finish-reason strings ─────────────────────────────────────────────────

    #[test]
    fn finish_reason_round_trips_to_wire_names() {
        assert_eq!(finish_reason_str(FinishReason::Stop), "stop");
        assert_eq!(finish_reason_str(FinishReason::ToolCalls), "tool_calls");
        assert_eq!(finish_reason_str(FinishReason::None), "");
    }
}
