#![allow(clippy::must_use_candidate)]

pub mod chat;
mod env;
pub mod llm;
mod loader;
pub mod telemetry;

use serde::Deserialize;

pub use chat::*;
pub use llm::*;
pub use telemetry::{LogFormat, TelemetryConfig};

/// Top-level Synapse configuration
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// LLM provider and conversation configuration
    #[serde(default)]
    pub llm: LlmConfig,
    /// Logging configuration
    #[serde(default)]
    pub telemetry: Option<TelemetryConfig>,
}
