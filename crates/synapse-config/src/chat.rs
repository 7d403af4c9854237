use std::time::Duration;

use serde::Deserialize;

/// Conversation turn settings shared by the streaming handler and the tool loop
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChatConfig {
    /// Upstream request timeout per round (e.g. "90s", "2m")
    #[serde(default = "default_request_timeout")]
    pub request_timeout: String,
    /// Maximum number of LLM rounds in one tool-calling turn
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    /// Per-conversation capacity of the client event channel
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
    /// Message shown to the user when a request times out
    #[serde(default = "default_timeout_message")]
    pub timeout_message: String,
}

impl ChatConfig {
    /// Parsed request timeout
    ///
    /// # Errors
    ///
    /// Returns an error if `request_timeout` is not a valid duration string
    pub fn request_timeout(&self) -> anyhow::Result<Duration> {
        duration_str::parse(&self.request_timeout)
            .map_err(|e| anyhow::anyhow!("invalid llm.chat.request_timeout '{}': {e}", self.request_timeout))
    }
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            request_timeout: default_request_timeout(),
            max_iterations: default_max_iterations(),
            event_buffer: default_event_buffer(),
            timeout_message: default_timeout_message(),
        }
    }
}

fn default_request_timeout() -> String {
    "2m".to_owned()
}

const fn default_max_iterations() -> u32 {
    10
}

const fn default_event_buffer() -> usize {
    256
}

fn default_timeout_message() -> String {
    "The request timed out before the model finished responding. Please try again.".to_owned()
}
