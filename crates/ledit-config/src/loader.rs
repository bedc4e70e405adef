// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::path::Path;

use anyhow::Context;
use serde::Deserialize;
use tracing::debug;

use crate::schema::{AgentConfig, Config, ModelConfig, ProviderPolicy};

/// A project overlay file: only the sections it actually sets override the
/// global config.  An absent section leaves the global value alone instead
/// of resetting it to defaults.
#[derive(Debug, Default, Deserialize)]
struct Overlay {
    model: Option<ModelConfig>,
    agent: Option<AgentConfig>,
    #[serde(default)]
    policies: HashMap<String, ProviderPolicy>,
}

/// Load the effective configuration.
///
/// Layering, lowest priority first:
/// 1. built-in defaults,
/// 2. `$HOME/.ledit/config.yaml`,
/// 3. `./.ledit/config.yaml` in the working directory.
///
/// A missing file at either location is not an error; a malformed file is.
pub fn load() -> anyhow::Result<Config> {
    let mut cfg = Config::default();
    if let Some(home) = dirs::home_dir() {
        let global = home.join(".ledit").join("config.yaml");
        if global.exists() {
            cfg = load_from(&global)?;
        }
    }
    let local = Path::new(".ledit").join("config.yaml");
    if local.exists() {
        let overlay = load_overlay(&local)?;
        apply_overlay(&mut cfg, overlay);
    }
    Ok(cfg)
}

/// Load configuration from an explicit path.
pub fn load_from(path: &Path) -> anyhow::Result<Config> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let cfg: Config = serde_yaml::from_str(&text)
        .with_context(|| format!("invalid YAML in {}", path.display()))?;
    debug!(path = %path.display(), "loaded config");
    Ok(cfg)
}

fn load_overlay(path: &Path) -> anyhow::Result<Overlay> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("invalid YAML in {}", path.display()))
}

fn apply_overlay(cfg: &mut Config, overlay: Overlay) {
    if let Some(model) = overlay.model {
        cfg.model = model;
    }
    if let Some(agent) = overlay.agent {
        cfg.agent = agent;
    }
    for (provider, policy) in overlay.policies {
        cfg.policies
            .entry(provider)
            .and_modify(|existing| existing.merge(&policy))
            .or_insert(policy);
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
