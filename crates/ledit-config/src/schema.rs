// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    /// Per-provider behaviour overrides, keyed by provider id.
    ///
    /// Each entry is merged on top of the built-in policy for that provider
    /// (see [`ProviderPolicy::builtin_for`]).
    ///
    /// ```yaml
    /// policies:
    ///   minimax:
    ///     requires_explicit_completion: true
    ///     strict_role_alternation: true
    ///   ollama:
    ///     timeouts:
    ///       first_chunk_secs: 180
    /// ```
    #[serde(default)]
    pub policies: HashMap<String, ProviderPolicy>,
}

impl Config {
    /// Resolve the effective policy for a provider id: built-in defaults
    /// with any user-configured entry merged on top.
    pub fn policy_for(&self, provider: &str) -> ProviderPolicy {
        let mut policy = ProviderPolicy::builtin_for(provider);
        if let Some(user) = self.policies.get(provider) {
            policy.merge(user);
        }
        policy
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Provider identifier: "openai" | "deepseek" | "minimax" | "ollama" |
    /// "openrouter" | "mock", or any id combined with a custom `base_url`
    /// that speaks the OpenAI chat-completions wire format.
    pub provider: String,
    /// Model name forwarded to the provider API
    pub name: String,
    /// Environment variable that holds the API key (read at runtime)
    pub api_key_env: Option<String>,
    /// Explicit API key; prefer api_key_env in config files to avoid secrets
    /// in version-controlled files
    pub api_key: Option<String>,
    /// Base URL override.  Useful for local servers and gateways.
    pub base_url: Option<String>,
    /// Maximum tokens to request in a single completion
    pub max_tokens: Option<u32>,
    /// Sampling temperature (0.0–2.0)
    pub temperature: Option<f32>,
    /// Context window size in tokens.  The pruner keeps outbound requests
    /// under this limit; when unset a conservative default applies.
    pub max_context_tokens: Option<usize>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: "openai".into(),
            name: "gpt-4o".into(),
            api_key_env: None,
            api_key: None,
            base_url: None,
            max_tokens: Some(4096),
            temperature: Some(0.2),
            max_context_tokens: None,
        }
    }
}

fn default_question_iteration_budget() -> u32 {
    25
}
fn default_task_iteration_budget() -> u32 {
    1000
}
fn default_max_retries() -> u32 {
    3
}
fn default_breaker_threshold() -> u32 {
    5
}
fn default_breaker_window_secs() -> u64 {
    60
}
fn default_inactivity_timeout_secs() -> u64 {
    420
}
fn default_prune_trigger_fraction() -> f32 {
    0.8
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Iteration budget for queries that look like plain questions.
    #[serde(default = "default_question_iteration_budget")]
    pub question_iteration_budget: u32,
    /// Iteration budget for task-shaped queries (the model has used a
    /// structured todo tool during the query).
    #[serde(default = "default_task_iteration_budget")]
    pub task_iteration_budget: u32,
    /// Retries after the first failed attempt on transient transport errors.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Identical tool invocations tolerated within the breaker window before
    /// suppression kicks in.
    #[serde(default = "default_breaker_threshold")]
    pub circuit_breaker_threshold: u32,
    /// Sliding-window length for circuit-breaker repetition counting.
    #[serde(default = "default_breaker_window_secs")]
    pub circuit_breaker_window_secs: u64,
    /// Seconds without a streamed chunk or a tool completion before the
    /// query is cancelled as stalled.
    #[serde(default = "default_inactivity_timeout_secs")]
    pub inactivity_timeout_secs: u64,
    /// Context fraction at which the pruner starts dropping old turns.
    #[serde(default = "default_prune_trigger_fraction")]
    pub prune_trigger_fraction: f32,
    /// Lossless context reshaping (folding short tool results, eliding
    /// duplicate file reads) before the lossy pruner runs.
    #[serde(default = "default_true")]
    pub optimizer_enabled: bool,
    /// After a completed task, replace prior turns with a short summary so
    /// follow-up questions in the same session start from clean context.
    #[serde(default = "default_true")]
    pub completion_summary_enabled: bool,
    /// System prompt override; leave None to use the built-in prompt
    #[serde(default)]
    pub system_prompt: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            question_iteration_budget: default_question_iteration_budget(),
            task_iteration_budget: default_task_iteration_budget(),
            max_retries: default_max_retries(),
            circuit_breaker_threshold: default_breaker_threshold(),
            circuit_breaker_window_secs: default_breaker_window_secs(),
            inactivity_timeout_secs: default_inactivity_timeout_secs(),
            prune_trigger_fraction: default_prune_trigger_fraction(),
            optimizer_enabled: true,
            completion_summary_enabled: true,
            system_prompt: None,
        }
    }
}

// ─── Provider policy ─────────────────────────────────────────────────────────

/// Behavioural quirks of a provider family.
///
/// Providers are not subclassed; each one composes its own policy record.
/// Every field is optional in user config so partial overrides merge cleanly
/// over the built-in defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderPolicy {
    /// When true, a `stop` finish reason alone does not end the query; the
    /// model must emit the explicit completion sentinel.
    #[serde(default)]
    pub requires_explicit_completion: Option<bool>,
    /// When true, tool results must immediately follow the assistant message
    /// that issued them; no extra user message may summarize tool execution.
    #[serde(default)]
    pub strict_role_alternation: Option<bool>,
    /// Force streaming on/off for this provider.
    #[serde(default)]
    pub streaming_enabled: Option<bool>,
    /// Whether the provider honours the reasoning-effort knob at all.
    #[serde(default)]
    pub supports_reasoning_effort: Option<bool>,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
}

impl ProviderPolicy {
    /// Built-in defaults per provider id.  Unknown providers get the
    /// OpenAI-shaped defaults.
    pub fn builtin_for(provider: &str) -> Self {
        match provider {
            // Minimax terminates streams with `stop` mid-task and forbids a
            // user message between tool results and the next assistant turn.
            "minimax" => Self {
                requires_explicit_completion: Some(true),
                strict_role_alternation: Some(true),
                streaming_enabled: Some(true),
                supports_reasoning_effort: Some(false),
                timeouts: TimeoutConfig::default(),
            },
            // Local servers are slow to produce the first token.
            "ollama" => Self {
                requires_explicit_completion: Some(false),
                strict_role_alternation: Some(false),
                streaming_enabled: Some(true),
                supports_reasoning_effort: Some(false),
                timeouts: TimeoutConfig {
                    connect_secs: Some(10),
                    first_chunk_secs: Some(180),
                    chunk_secs: Some(120),
                    overall_secs: Some(900),
                },
            },
            "deepseek" => Self {
                requires_explicit_completion: Some(false),
                strict_role_alternation: Some(false),
                streaming_enabled: Some(true),
                supports_reasoning_effort: Some(false),
                timeouts: TimeoutConfig::default(),
            },
            _ => Self {
                requires_explicit_completion: Some(false),
                strict_role_alternation: Some(false),
                streaming_enabled: Some(true),
                supports_reasoning_effort: Some(true),
                timeouts: TimeoutConfig::default(),
            },
        }
    }

    /// Merge `other` on top of `self`: any field set in `other` wins.
    pub fn merge(&mut self, other: &ProviderPolicy) {
        if other.requires_explicit_completion.is_some() {
            self.requires_explicit_completion = other.requires_explicit_completion;
        }
        if other.strict_role_alternation.is_some() {
            self.strict_role_alternation = other.strict_role_alternation;
        }
        if other.streaming_enabled.is_some() {
            self.streaming_enabled = other.streaming_enabled;
        }
        if other.supports_reasoning_effort.is_some() {
            self.supports_reasoning_effort = other.supports_reasoning_effort;
        }
        self.timeouts.merge(&other.timeouts);
    }

    pub fn requires_explicit_completion(&self) -> bool {
        self.requires_explicit_completion.unwrap_or(false)
    }

    pub fn strict_role_alternation(&self) -> bool {
        self.strict_role_alternation.unwrap_or(false)
    }

    pub fn streaming_enabled(&self) -> bool {
        self.streaming_enabled.unwrap_or(true)
    }

    pub fn supports_reasoning_effort(&self) -> bool {
        self.supports_reasoning_effort.unwrap_or(true)
    }
}

/// The four client timeout budgets, in seconds.  `None` falls back to the
/// built-in default for that budget.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Time to establish the transport connection.
    #[serde(default)]
    pub connect_secs: Option<u64>,
    /// From request sent to the first response byte.
    #[serde(default)]
    pub first_chunk_secs: Option<u64>,
    /// Maximum silence between successive streamed chunks.
    #[serde(default)]
    pub chunk_secs: Option<u64>,
    /// Hard upper bound on the whole request.
    #[serde(default)]
    pub overall_secs: Option<u64>,
}

impl TimeoutConfig {
    pub fn merge(&mut self, other: &TimeoutConfig) {
        if other.connect_secs.is_some() {
            self.connect_secs = other.connect_secs;
        }
        if other.first_chunk_secs.is_some() {
            self.first_chunk_secs = other.first_chunk_secs;
        }
        if other.chunk_secs.is_some() {
            self.chunk_secs = other.chunk_secs;
        }
        if other.overall_secs.is_some() {
            self.overall_secs = other.overall_secs;
        }
    }

    pub fn connect(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.connect_secs.unwrap_or(15))
    }

    pub fn first_chunk(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.first_chunk_secs.unwrap_or(60))
    }

    pub fn chunk(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.chunk_secs.unwrap_or(45))
    }

    pub fn overall(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.overall_secs.unwrap_or(600))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_deserializes_from_empty_yaml() {
        let cfg: Config = serde_yaml::from_str("{}").unwrap();
        assert_eq!(cfg.model.provider, "openai");
        assert_eq!(cfg.agent.question_iteration_budget, 25);
        assert_eq!(cfg.agent.task_iteration_budget, 1000);
    }

    #[test]
    fn agent_defaults_expose_breaker_knobs() {
        let a = AgentConfig::default();
        assert_eq!(a.circuit_breaker_threshold, 5);
        assert_eq!(a.circuit_breaker_window_secs, 60);
        assert_eq!(a.inactivity_timeout_secs, 420);
    }

    #[test]
    fn prune_trigger_defaults_to_eighty_percent() {
        let a = AgentConfig::default();
        assert!((a.prune_trigger_fraction - 0.8).abs() < f32::EPSILON);
    }

    #[test]
    fn builtin_policy_minimax_requires_sentinel() {
        let p = ProviderPolicy::builtin_for("minimax");
        assert!(p.requires_explicit_completion());
        assert!(p.strict_role_alternation());
        assert!(!p.supports_reasoning_effort());
    }

    #[test]
    fn builtin_policy_unknown_provider_is_permissive() {
        let p = ProviderPolicy::builtin_for("somebody-new");
        assert!(!p.requires_explicit_completion());
        assert!(!p.strict_role_alternation());
        assert!(p.streaming_enabled());
    }

    #[test]
    fn builtin_policy_ollama_stretches_first_chunk() {
        let p = ProviderPolicy::builtin_for("ollama");
        assert_eq!(p.timeouts.first_chunk().as_secs(), 180);
    }

    #[test]
    fn policy_merge_overrides_only_set_fields() {
        let mut base = ProviderPolicy::builtin_for("openai");
        let user = ProviderPolicy {
            requires_explicit_completion: Some(true),
            ..Default::default()
        };
        base.merge(&user);
        assert!(base.requires_explicit_completion());
        // Untouched fields keep the built-in values.
        assert!(base.streaming_enabled());
    }

    #[test]
    fn policy_for_merges_user_entry_over_builtin() {
        let yaml = r#"
policies:
  openai:
    timeouts:
      overall_secs: 120
"#;
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        let p = cfg.policy_for("openai");
        assert_eq!(p.timeouts.overall().as_secs(), 120);
        // Unset budgets fall back to built-in defaults.
        assert_eq!(p.timeouts.first_chunk().as_secs(), 60);
    }

    #[test]
    fn timeout_defaults_are_layered() {
        let t = TimeoutConfig::default();
        assert_eq!(t.connect().as_secs(), 15);
        assert_eq!(t.first_chunk().as_secs(), 60);
        assert_eq!(t.chunk().as_secs(), 45);
        assert_eq!(t.overall().as_secs(), 600);
    }

    #[test]
    fn model_config_yaml_round_trip() {
        let yaml = r#"
model:
  provider: deepseek
  name: deepseek-chat
  api_key_env: DEEPSEEK_API_KEY
  max_context_tokens: 64000
"#;
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.model.provider, "deepseek");
        assert_eq!(cfg.model.max_context_tokens, Some(64000));
        assert_eq!(cfg.model.api_key_env.as_deref(), Some("DEEPSEEK_API_KEY"));
    }
}
