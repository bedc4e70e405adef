// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
pub mod builtin;
pub mod circuit_breaker;
pub mod executor;
pub mod fallback;
mod registry;
mod tool;

pub use circuit_breaker::{BreakerDecision, CircuitBreaker};
pub use executor::ToolExecutor;
pub use fallback::{
    looks_like_tool_attempt, parse_arguments, parse_tool_calls, FallbackParse, RecoveredCall,
};
pub use registry::ToolRegistry;
pub use tool::{Tool, ToolInvocation, ToolOutcome};
