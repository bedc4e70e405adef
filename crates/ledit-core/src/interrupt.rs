// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Interrupt sources and mid-query input injection.
//!
//! Three sources may cancel a query: the external interrupt handle (escape
//! key), the inactivity watchdog, and an explicit programmatic cancel on
//! the per-query token.  Injected input does not cancel anything; it is
//! drained at the top of every iteration and appended to the transcript.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, Notify};
use tracing::warn;

pub use ledit_model::CancelToken;

/// Long-lived handle a UI thread can hold to interrupt whichever query is
/// currently running.  Firing between queries is a no-op by design: each
/// query bridges the handle onto a fresh cancellation token, so stale
/// interrupts never leak into the next query.
#[derive(Clone)]
pub struct InterruptHandle {
    notify: Arc<Notify>,
}

impl InterruptHandle {
    pub fn new() -> Self {
        Self {
            notify: Arc::new(Notify::new()),
        }
    }

    pub fn interrupt(&self) {
        self.notify.notify_waiters();
    }

    /// Spawn a task that cancels `token` when the handle fires.  The
    /// returned guard aborts the bridge when the query ends.
    pub fn bridge_to(&self, token: CancelToken) -> BridgeGuard {
        let notify = Arc::clone(&self.notify);
        let handle = tokio::spawn(async move {
            notify.notified().await;
            token.cancel();
        });
        BridgeGuard { handle }
    }
}

impl Default for InterruptHandle {
    fn default() -> Self {
        Self::new()
    }
}

pub struct BridgeGuard {
    handle: tokio::task::JoinHandle<()>,
}

impl Drop for BridgeGuard {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

// ─── Input injection ──────────────────────────────────────────────────────────

/// Channel for user text pushed into a running query.  The sender side is
/// clonable and handed to the UI; the engine drains non-blockingly at the
/// top of every iteration.
pub struct InputInjector {
    tx: mpsc::UnboundedSender<String>,
    rx: mpsc::UnboundedReceiver<String>,
}

impl InputInjector {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self { tx, rx }
    }

    pub fn sender(&self) -> mpsc::UnboundedSender<String> {
        self.tx.clone()
    }

    /// Drain everything queued so far without waiting.
    pub fn try_drain(&mut self) -> Vec<String> {
        let mut drained = Vec::new();
        while let Ok(text) = self.rx.try_recv() {
            if !text.trim().is_empty() {
                drained.push(text);
            }
        }
        drained
    }
}

impl Default for InputInjector {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Inactivity watchdog ──────────────────────────────────────────────────────

/// Cancels the query when no chunk or tool completion has been observed for
/// the configured duration.  Activity marks come from the streaming
/// callback and from the tool loop.
pub struct InactivityWatchdog {
    last_activity: Arc<Mutex<Instant>>,
    handle: tokio::task::JoinHandle<()>,
}

impl InactivityWatchdog {
    pub fn arm(timeout: Duration, token: CancelToken) -> Self {
        let last_activity = Arc::new(Mutex::new(Instant::now()));
        let last = Arc::clone(&last_activity);
        let watch_token = token.clone();
        let handle = tokio::spawn(async move {
            loop {
                let idle = watch_token.is_cancelled();
                if idle {
                    return;
                }
                let elapsed = last.lock().unwrap().elapsed();
                if elapsed >= timeout {
                    warn!(
                        idle_secs = elapsed.as_secs(),
                        "inactivity timeout; cancelling query"
                    );
                    watch_token.cancel();
                    return;
                }
                // Sleep until the current deadline would expire; a mark in
                // the meantime just pushes the next check further out.
                tokio::time::sleep(timeout - elapsed).await;
            }
        });
        Self {
            last_activity,
            handle,
        }
    }

    /// Record activity (a streamed chunk or a finished tool call).
    pub fn mark(&self) {
        *self.last_activity.lock().unwrap() = Instant::now();
    }

    /// A clonable marker for callbacks that outlive `&self` borrows.
    pub fn marker(&self) -> ActivityMarker {
        ActivityMarker {
            last_activity: Arc::clone(&self.last_activity),
        }
    }
}

impl Drop for InactivityWatchdog {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[derive(Clone)]
pub struct ActivityMarker {
    last_activity: Arc<Mutex<Instant>>,
}

impl ActivityMarker {
    pub fn mark(&self) {
        *self.last_activity.lock().unwrap() = Instant::now();
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
