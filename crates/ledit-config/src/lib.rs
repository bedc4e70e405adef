// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod schema;
mod loader;
pub mod env;

pub use loader::{load, load_from};
pub use schema::{
    AgentConfig, Config, ModelConfig, ProviderPolicy, TimeoutConfig,
};
