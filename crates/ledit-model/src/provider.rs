// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;

use crate::{ChatRequest, ResponseEvent};

pub type ResponseStream = Pin<Box<dyn Stream<Item = anyhow::Result<ResponseEvent>> + Send>>;

/// The uniform provider capability consumed by the streaming client.
///
/// Concrete drivers configure themselves (URL, auth, quirks) and expose the
/// same event-stream contract; nothing above this trait knows which wire
/// format is in play.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    /// Stable provider id, e.g. "openai" or "deepseek".
    fn provider(&self) -> &str;

    /// Model identifier as reported to users.
    fn model(&self) -> &str;

    /// Issue a completion request and return the streaming event sequence.
    /// Non-streaming requests still go through the same stream shape; the
    /// driver just emits the assembled events at once.
    async fn complete(&self, req: ChatRequest) -> anyhow::Result<ResponseStream>;
}
