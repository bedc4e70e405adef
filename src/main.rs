// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;

use std::io::{IsTerminal, Read, Write};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use cli::{Cli, Commands};
use ledit_core::{Engine, EngineError, EngineEvent};
use ledit_tools::{builtin::register_builtin, ToolRegistry};

const EXIT_AGENT_ERROR: i32 = 1;
const EXIT_TIMEOUT: i32 = 124;
const EXIT_INTERRUPT: i32 = 130;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let mut config = match &cli.config {
        Some(path) => ledit_config::load_from(path)?,
        None => ledit_config::load()?,
    };
    cli.apply_model_override(&mut config);
    if let Some(budget) = cli.max_iterations {
        config.agent.question_iteration_budget = budget;
        config.agent.task_iteration_budget = budget;
    }

    if let Some(cmd) = &cli.command {
        match cmd {
            Commands::ShowConfig => {
                println!("{}", serde_yaml_string(&config));
                return Ok(());
            }
            Commands::ListTools => {
                let mut registry = ToolRegistry::new();
                register_builtin(&mut registry);
                for schema in registry.schemas() {
                    let tool = registry.get(&schema.name).unwrap();
                    println!(
                        "{:<16} [{}] {}",
                        schema.name,
                        tool.required_permissions().join(", "),
                        schema.description.lines().next().unwrap_or("")
                    );
                }
                return Ok(());
            }
        }
    }

    let query = match cli.query.clone() {
        Some(q) => q,
        None => {
            let mut buf = String::new();
            if std::io::stdin().is_terminal() {
                anyhow::bail!("no query given; pass one as an argument or pipe it on stdin");
            }
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("reading query from stdin")?;
            buf.trim().to_string()
        }
    };
    if query.is_empty() {
        anyhow::bail!("empty query");
    }

    let provider: Arc<dyn ledit_model::ChatProvider> =
        Arc::from(ledit_model::from_config(&config.model)?);
    let mut registry = ToolRegistry::new();
    register_builtin(&mut registry);

    let mut engine = Engine::new(provider, Arc::new(registry), config);
    let events = engine.take_events().expect("events taken once");

    // Ctrl-C interrupts the query but keeps the process alive long enough
    // to print the preserved-conversation notice.
    let interrupt = engine.interrupt_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            interrupt.interrupt();
        }
    });

    let printer = tokio::spawn(print_events(events, cli.no_stream));

    match engine.process_query(&query).await {
        Ok(final_text) => {
            // The streamed deltas already showed the text; repeat it only
            // in no-stream mode or when nothing was streamed.
            let _ = printer.await;
            if cli.no_stream {
                println!("{final_text}");
            } else {
                println!();
            }
            Ok(())
        }
        Err(e) => {
            let _ = printer.await;
            eprintln!("ledit: {e}");
            let code = match &e {
                EngineError::Cancelled => EXIT_INTERRUPT,
                EngineError::Api { source, .. }
                    if matches!(source, ledit_model::ApiError::Timeout { .. }) =>
                {
                    EXIT_TIMEOUT
                }
                _ => EXIT_AGENT_ERROR,
            };
            std::process::exit(code);
        }
    }
}

/// Render engine events to stdout/stderr until the engine finishes the
/// query.  Streaming deltas go to stdout; tool progress goes to stderr so
/// piped output stays clean.
async fn print_events(
    mut events: tokio::sync::mpsc::UnboundedReceiver<EngineEvent>,
    no_stream: bool,
) {
    while let Some(event) = events.recv().await {
        match event {
            EngineEvent::TextDelta(chunk) => {
                if !no_stream {
                    print!("{chunk}");
                    let _ = std::io::stdout().flush();
                }
            }
            EngineEvent::ToolCallStarted {
                tool_name,
                arguments,
                ..
            } => {
                eprintln!("[tool] {tool_name} {arguments}");
            }
            EngineEvent::ToolCallFinished {
                tool_name,
                is_error,
                ..
            } => {
                if is_error {
                    eprintln!("[tool] {tool_name} failed");
                }
            }
            EngineEvent::ContextPruned {
                tokens_before,
                tokens_after,
                aggressive,
            } => {
                eprintln!(
                    "[context] pruned {tokens_before} -> {tokens_after} tokens{}",
                    if aggressive { " (aggressive)" } else { "" }
                );
            }
            EngineEvent::QueryComplete => break,
            _ => {}
        }
    }
}

fn init_logging(verbose: u8) {
    let default_level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("ledit={default_level}")));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn serde_yaml_string(config: &ledit_config::Config) -> String {
    serde_yaml::to_string(config).unwrap_or_default()
}
