// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
pub mod cancel;
pub mod client;
pub mod error;
pub mod retry;
pub mod sanitize;
pub(crate) mod openai_compat;
mod types;
mod provider;
mod mock;

pub use cancel::CancelToken;
pub use client::ApiClient;
pub use error::{ApiError, TimeoutBudget};
pub use mock::{MockProvider, Script, ScriptedMockProvider};
pub use provider::{ChatProvider, ResponseStream};
pub use retry::{RateLimitState, RetryConfig};
pub use types::*;

use anyhow::bail;
use openai_compat::{AuthStyle, OpenAiCompatProvider};
use ledit_config::ModelConfig;

/// Construct a boxed [`ChatProvider`] from configuration.
///
/// All hosted and local drivers share the OpenAI-compatible wire format;
/// the provider id selects the endpoint, auth style, and default key
/// environment variable.
pub fn from_config(cfg: &ModelConfig) -> anyhow::Result<Box<dyn ChatProvider>> {
    let key = resolve_api_key(cfg);
    let base_url = |default: &str| -> String {
        cfg.base_url.clone().unwrap_or_else(|| default.into())
    };

    match cfg.provider.as_str() {
        "openai" => Ok(Box::new(OpenAiCompatProvider::new(
            "openai",
            cfg.name.clone(),
            key,
            &base_url("https://api.openai.com/v1"),
            cfg.max_tokens,
            cfg.temperature,
            vec![],
            AuthStyle::Bearer,
        ))),
        "deepseek" => Ok(Box::new(OpenAiCompatProvider::new(
            "deepseek",
            cfg.name.clone(),
            key,
            &base_url("https://api.deepseek.com/v1"),
            cfg.max_tokens,
            cfg.temperature,
            vec![],
            AuthStyle::Bearer,
        ))),
        "minimax" => Ok(Box::new(OpenAiCompatProvider::new(
            "minimax",
            cfg.name.clone(),
            key,
            &base_url("https://api.minimax.chat/v1"),
            cfg.max_tokens,
            cfg.temperature,
            vec![],
            AuthStyle::Bearer,
        ))),
        "openrouter" => Ok(Box::new(OpenAiCompatProvider::new(
            "openrouter",
            cfg.name.clone(),
            key,
            &base_url("https://openrouter.ai/api/v1"),
            cfg.max_tokens,
            cfg.temperature,
            vec![("X-Title".into(), "ledit".into())],
            AuthStyle::Bearer,
        ))),
        "ollama" => Ok(Box::new(OpenAiCompatProvider::new(
            "ollama",
            cfg.name.clone(),
            None, // no key needed
            &base_url("http://localhost:11434/v1"),
            cfg.max_tokens,
            cfg.temperature,
            vec![],
            AuthStyle::None,
        ))),
        "mock" => Ok(Box::new(MockProvider)),
        other => {
            // Any unrecognized id with an explicit base_url is treated as a
            // custom OpenAI-compatible endpoint.
            if cfg.base_url.is_some() {
                return Ok(Box::new(OpenAiCompatProvider::new(
                    other.to_string(),
                    cfg.name.clone(),
                    key.clone(),
                    cfg.base_url.as_deref().unwrap_or_default(),
                    cfg.max_tokens,
                    cfg.temperature,
                    vec![],
                    if key.is_some() { AuthStyle::Bearer } else { AuthStyle::None },
                )));
            }
            bail!(
                "unknown model provider: {other:?}\n\
                 Known providers: openai, deepseek, minimax, openrouter, ollama, mock \
                 (or set base_url for a custom OpenAI-compatible endpoint)"
            )
        }
    }
}

fn resolve_api_key(cfg: &ModelConfig) -> Option<String> {
    if let Some(k) = &cfg.api_key {
        return Some(k.clone());
    }
    if let Some(env) = &cfg.api_key_env {
        return std::env::var(env).ok();
    }
    // Fall through to the canonical env var for the provider.
    let default_env = match cfg.provider.as_str() {
        "openai" => "OPENAI_API_KEY",
        "deepseek" => "DEEPSEEK_API_KEY",
        "minimax" => "MINIMAX_API_KEY",
        "openrouter" => "OPENROUTER_API_KEY",
        _ => return None,
    };
    std::env::var(default_env).ok()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
