// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Tool dispatch.
//!
//! Batches where every call is a pure read fan out in parallel and are
//! reassembled in input order by index slot; anything else runs
//! sequentially.  Every call id in the batch gets exactly one outcome —
//! including suppressed, unknown-tool, panicked, and cancelled calls — so
//! the transcript's tool-call/result invariant holds unconditionally.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use ledit_model::CancelToken;

use crate::{
    circuit_breaker::{BreakerDecision, CircuitBreaker},
    registry::ToolRegistry,
    tool::{ToolInvocation, ToolOutcome},
};

pub struct ToolExecutor {
    registry: Arc<ToolRegistry>,
    breaker: Arc<CircuitBreaker>,
}

impl ToolExecutor {
    pub fn new(registry: Arc<ToolRegistry>, threshold: u32, window: Duration) -> Self {
        Self {
            registry,
            breaker: Arc::new(CircuitBreaker::new(threshold, window)),
        }
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// Forget breaker history.  Called at the start of each fresh query.
    pub fn reset_breaker(&self) {
        self.breaker.reset();
    }

    /// Execute a batch of calls, producing one outcome per call in input
    /// order.
    pub async fn execute_batch(
        &self,
        calls: &[ToolInvocation],
        cancel: &CancelToken,
    ) -> Vec<ToolOutcome> {
        if calls.is_empty() {
            return Vec::new();
        }

        let all_read_only = calls.iter().all(|c| self.registry.is_read_only(&c.name));
        if all_read_only && calls.len() >= 2 {
            self.execute_parallel(calls, cancel).await
        } else {
            self.execute_sequential(calls, cancel).await
        }
    }

    async fn execute_sequential(
        &self,
        calls: &[ToolInvocation],
        cancel: &CancelToken,
    ) -> Vec<ToolOutcome> {
        let mut outcomes = Vec::with_capacity(calls.len());
        for call in calls {
            if cancel.is_cancelled() {
                outcomes.push(cancelled_outcome(call));
                continue;
            }
            outcomes.push(execute_one(&self.registry, &self.breaker, call).await);
        }
        outcomes
    }

    async fn execute_parallel(
        &self,
        calls: &[ToolInvocation],
        cancel: &CancelToken,
    ) -> Vec<ToolOutcome> {
        debug!(count = calls.len(), "dispatching read batch in parallel");
        let mut handles = Vec::with_capacity(calls.len());
        for call in calls {
            let registry = Arc::clone(&self.registry);
            let breaker = Arc::clone(&self.breaker);
            let call = call.clone();
            handles.push(tokio::spawn(async move {
                execute_one(&registry, &breaker, &call).await
            }));
        }

        // Collect by index slot so outcomes land in input order regardless
        // of completion order.
        let mut outcomes = Vec::with_capacity(calls.len());
        let mut cancelled = false;
        for (i, mut handle) in handles.into_iter().enumerate() {
            if cancelled {
                outcomes.push(flush_or_cancel(handle, &calls[i]).await);
                continue;
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    cancelled = true;
                    outcomes.push(flush_or_cancel(handle, &calls[i]).await);
                }
                res = &mut handle => {
                    outcomes.push(unwrap_task(res, &calls[i]));
                }
            }
        }
        outcomes
    }
}

/// After cancellation: keep a finished task's real outcome, synthesize a
/// cancelled one for anything still in flight.
async fn flush_or_cancel(
    handle: tokio::task::JoinHandle<ToolOutcome>,
    call: &ToolInvocation,
) -> ToolOutcome {
    if handle.is_finished() {
        unwrap_task(handle.await, call)
    } else {
        handle.abort();
        cancelled_outcome(call)
    }
}

fn unwrap_task(
    res: Result<ToolOutcome, tokio::task::JoinError>,
    call: &ToolInvocation,
) -> ToolOutcome {
    match res {
        Ok(outcome) => outcome,
        Err(e) => {
            warn!(tool = %call.name, "tool task failed: {e}");
            ToolOutcome::err(
                &call.id,
                &call.name,
                format!("Error executing tool {}: task failed: {e}", call.name),
            )
        }
    }
}

fn cancelled_outcome(call: &ToolInvocation) -> ToolOutcome {
    ToolOutcome::err(
        &call.id,
        &call.name,
        format!("Tool {} was cancelled before completion.", call.name),
    )
}

async fn execute_one(
    registry: &ToolRegistry,
    breaker: &CircuitBreaker,
    call: &ToolInvocation,
) -> ToolOutcome {
    let args_text = call.args.to_string();
    if let BreakerDecision::Suppress { count } = breaker.check(&call.name, &args_text) {
        return ToolOutcome::ok(
            &call.id,
            &call.name,
            CircuitBreaker::suppression_message(&call.name, count),
        );
    }

    let tool = match registry.get(&call.name) {
        Some(t) => t,
        None => {
            return ToolOutcome::err(
                &call.id,
                &call.name,
                format!("Error executing tool {}: unknown tool", call.name),
            )
        }
    };

    debug!(tool = %call.name, call_id = %call.id, "executing tool");
    match tool.execute(&call.args).await {
        Ok(content) => ToolOutcome::ok(&call.id, &call.name, content),
        Err(e) => ToolOutcome::err(
            &call.id,
            &call.name,
            format!("Error executing tool {}: {e:#}", call.name),
        ),
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
