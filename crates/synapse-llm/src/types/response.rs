use std::fmt;
use std::ops::AddAssign;

use serde::{Deserialize, Serialize};

/// Reason a turn or a single model response stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// Natural end of generation
    Stop,
    /// Hit the `max_tokens` limit
    Length,
    /// Model decided to call a tool
    ToolCalls,
    /// Content was filtered by safety systems
    ContentFilter,
    /// Provider reported an error as the finish reason
    Error,
    /// The tool loop ran out of rounds
    MaxIterations,
    /// The stream ended without a terminal event, or the client went away
    ConnectionClosed,
}

impl FinishReason {
    /// Map a provider finish/stop reason onto the canonical set
    ///
    /// Unrecognized reasons are treated as a normal stop.
    pub fn from_provider(reason: &str) -> Self {
        match reason {
            "length" | "max_tokens" | "MAX_TOKENS" => Self::Length,
            "tool_calls" | "tool_use" | "function_call" => Self::ToolCalls,
            "content_filter" | "refusal" | "SAFETY" | "RECITATION" | "BLOCKLIST" | "PROHIBITED_CONTENT" => {
                Self::ContentFilter
            }
            _ => Self::Stop,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Stop => "stop",
            Self::Length => "length",
            Self::ToolCalls => "tool_calls",
            Self::ContentFilter => "content_filter",
            Self::Error => "error",
            Self::MaxIterations => "max_iterations",
            Self::ConnectionClosed => "connection_closed",
        }
    }
}

impl fmt::Display for FinishReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Token usage statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    /// Tokens consumed by the prompt
    pub prompt_tokens: u32,
    /// Tokens generated in the completion
    pub completion_tokens: u32,
    /// Total tokens (prompt + completion)
    pub total_tokens: u32,
}

impl Usage {
    pub const fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens.saturating_add(completion_tokens),
        }
    }
}

impl AddAssign for Usage {
    fn add_assign(&mut self, rhs: Self) {
        self.prompt_tokens = self.prompt_tokens.saturating_add(rhs.prompt_tokens);
        self.completion_tokens = self.completion_tokens.saturating_add(rhs.completion_tokens);
        self.total_tokens = self.total_tokens.saturating_add(rhs.total_tokens);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_reasons_map_to_canonical_set() {
        assert_eq!(FinishReason::from_provider("end_turn"), FinishReason::Stop);
        assert_eq!(FinishReason::from_provider("STOP"), FinishReason::Stop);
        assert_eq!(FinishReason::from_provider("tool_use"), FinishReason::ToolCalls);
        assert_eq!(FinishReason::from_provider("MAX_TOKENS"), FinishReason::Length);
        assert_eq!(FinishReason::from_provider("SAFETY"), FinishReason::ContentFilter);
        assert_eq!(FinishReason::from_provider("something_new"), FinishReason::Stop);
    }

    #[test]
    fn serializes_snake_case() {
        let json = serde_json::to_string(&FinishReason::MaxIterations).unwrap();
        assert_eq!(json, "\"max_iterations\"");
        assert_eq!(FinishReason::ConnectionClosed.to_string(), "connection_closed");
    }

    #[test]
    fn usage_accumulates() {
        let mut total = Usage::default();
        total += Usage::new(10, 5);
        total += Usage::new(20, 1);
        assert_eq!(total, Usage::new(30, 6));
    }
}
