use std::path::PathBuf;

use clap::Parser;

/// Run one streamed chat turn and print its events
#[derive(Debug, Parser)]
#[command(name = "synapse", about = "Stream a chat turn from a configured LLM provider")]
pub struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "synapse.toml", env = "SYNAPSE_CONFIG")]
    pub config: PathBuf,

    /// Configured provider to use; defaults to the first one declared
    #[arg(short, long, env = "SYNAPSE_PROVIDER")]
    pub provider: Option<String>,

    /// Model identifier sent to the provider
    #[arg(short, long, env = "SYNAPSE_MODEL")]
    pub model: String,

    /// System prompt
    #[arg(short, long)]
    pub system: Option<String>,

    /// Log filter directive, overriding config and `RUST_LOG`
    #[arg(long)]
    pub log_filter: Option<String>,

    /// User message
    pub prompt: String,
}
