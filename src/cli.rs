// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// An agentic code-editing CLI driven by LLM tool calling.
#[derive(Parser, Debug)]
#[command(name = "ledit", version, about)]
pub struct Cli {
    /// The query to run.  Reads stdin when omitted and stdin is piped.
    pub query: Option<String>,

    /// Model override: "provider/name", a bare provider id, or a bare
    /// model name.
    #[arg(long, short = 'm')]
    pub model: Option<String>,

    /// Path to an explicit config file (default: ~/.ledit/config.yaml
    /// overlaid with ./.ledit/config.yaml).
    #[arg(long, short = 'c')]
    pub config: Option<PathBuf>,

    /// Override the iteration budget for this run.
    #[arg(long)]
    pub max_iterations: Option<u32>,

    /// Disable streaming output (the full response prints at once).
    #[arg(long)]
    pub no_stream: bool,

    /// Increase log verbosity on stderr (-v, -vv).
    #[arg(long, short = 'v', action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Print the effective configuration and exit.
    ShowConfig,
    /// List the registered tools with their permission labels.
    ListTools,
}

impl Cli {
    /// Apply the `--model` override: "provider/name" sets both fields, a
    /// bare token replaces the model name only.
    pub fn apply_model_override(&self, config: &mut ledit_config::Config) {
        if let Some(spec) = &self.model {
            if let Some((provider, name)) = spec.split_once('/') {
                config.model.provider = provider.to_string();
                config.model.name = name.to_string();
                // Credentials belong to the previous provider.
                config.model.api_key = None;
                config.model.api_key_env = None;
            } else {
                config.model.name = spec.clone();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_override_slash_form_sets_provider_and_name() {
        let cli = Cli::parse_from(["ledit", "-m", "deepseek/deepseek-chat", "hi"]);
        let mut config = ledit_config::Config::default();
        config.model.api_key = Some("old-secret".into());
        cli.apply_model_override(&mut config);
        assert_eq!(config.model.provider, "deepseek");
        assert_eq!(config.model.name, "deepseek-chat");
        assert!(config.model.api_key.is_none(), "stale credentials must be cleared");
    }

    #[test]
    fn model_override_bare_name_keeps_provider() {
        let cli = Cli::parse_from(["ledit", "-m", "gpt-4o-mini", "hi"]);
        let mut config = ledit_config::Config::default();
        cli.apply_model_override(&mut config);
        assert_eq!(config.model.provider, "openai");
        assert_eq!(config.model.name, "gpt-4o-mini");
    }

    #[test]
    fn query_is_positional() {
        let cli = Cli::parse_from(["ledit", "fix the bug"]);
        assert_eq!(cli.query.as_deref(), Some("fix the bug"));
    }
}
