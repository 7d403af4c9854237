use http::StatusCode;
use serde_json::Value;
use thiserror::Error;

/// Errors that can occur while driving a conversation turn
#[derive(Debug, Error)]
pub enum LlmError {
    /// Network failure before or while reading the upstream response
    #[error("transport error: {0}")]
    Transport(String),

    /// Upstream provider answered with a non-success status
    #[error("upstream error: {0}")]
    Upstream(ProviderError),

    /// Malformed or failed event inside the response stream
    #[error("streaming error: {0}")]
    Streaming(String),

    /// The request was cancelled (superseded, timed out, or stopped)
    #[error("request cancelled")]
    Cancelled,

    /// Named provider does not exist in configuration
    #[error("provider not found: {provider}")]
    ProviderNotFound { provider: String },

    /// Caller supplied a request the provider cannot accept
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// A passthrough tool failed, ending the turn
    #[error("tool '{tool}' failed: {message}")]
    ToolFailed { tool: String, message: String },

    /// Unexpected internal error
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl LlmError {
    /// Provider-neutral error code sent to clients
    pub fn code(&self) -> &str {
        match self {
            Self::Transport(_) => "transport_error",
            Self::Upstream(e) => &e.code,
            Self::Streaming(_) => "streaming_error",
            Self::Cancelled => "cancelled",
            Self::ProviderNotFound { .. } => "not_found_error",
            Self::InvalidRequest(_) => "invalid_request_error",
            Self::ToolFailed { .. } => "tool_error",
            Self::Internal(_) => "internal_error",
        }
    }

    /// HTTP status most closely describing the failure
    pub fn http_status(&self) -> Option<u16> {
        match self {
            Self::Upstream(e) => e.http_status,
            Self::Transport(_) => Some(StatusCode::BAD_GATEWAY.as_u16()),
            Self::ProviderNotFound { .. } => Some(StatusCode::NOT_FOUND.as_u16()),
            Self::InvalidRequest(_) => Some(StatusCode::BAD_REQUEST.as_u16()),
            Self::Streaming(_) | Self::Cancelled | Self::ToolFailed { .. } | Self::Internal(_) => None,
        }
    }

    pub const fn is_context_window_error(&self) -> bool {
        match self {
            Self::Upstream(e) => e.is_context_window_error,
            _ => false,
        }
    }

    /// Message safe to show to the end user
    pub fn client_message(&self) -> String {
        match self {
            Self::Upstream(e) => e.message.clone(),
            Self::Internal(_) => "an internal error occurred".to_owned(),
            other => other.to_string(),
        }
    }
}

impl From<reqwest::Error> for LlmError {
    fn from(e: reqwest::Error) -> Self {
        Self::Transport(e.to_string())
    }
}

/// Provider failure enriched with a neutral code and context-window hint
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message} ({code})")]
pub struct ProviderError {
    pub message: String,
    pub code: String,
    pub http_status: Option<u16>,
    pub is_context_window_error: bool,
}

/// Message fragments providers use when the prompt does not fit
const CONTEXT_WINDOW_PATTERNS: &[&str] = &[
    "context_length_exceeded",
    "maximum context length",
    "prompt is too long",
    "too many tokens",
    "context window",
    "exceeds the maximum number of tokens",
];

impl ProviderError {
    /// Translate a non-success upstream response
    ///
    /// The body may be any of the provider error envelopes (`OpenAI`,
    /// Anthropic, Google) or arbitrary text.
    pub fn from_response(status: StatusCode, body: &str) -> Self {
        let parsed = serde_json::from_str::<Value>(body).ok();
        let (message, provider_code) = parsed.as_ref().map_or((None, None), extract_error_fields);

        let message = message
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| fallback_message(status, body));

        let is_context_window_error = is_context_window(provider_code.as_deref(), &message);

        let code = if is_context_window_error {
            "context_length_exceeded".to_owned()
        } else {
            status_code_name(status).to_owned()
        };

        Self {
            message,
            code,
            http_status: Some(status.as_u16()),
            is_context_window_error,
        }
    }

    /// Error reported inside an otherwise successful stream
    pub fn in_stream(message: impl Into<String>, provider_code: Option<&str>) -> Self {
        let message = message.into();
        let is_context_window_error = is_context_window(provider_code, &message);

        Self {
            code: if is_context_window_error {
                "context_length_exceeded".to_owned()
            } else {
                provider_code.unwrap_or("upstream_error").to_owned()
            },
            message,
            http_status: None,
            is_context_window_error,
        }
    }
}

/// Pull `(message, code)` out of the known provider error envelopes
fn extract_error_fields(body: &Value) -> (Option<String>, Option<String>) {
    let error = body.get("error").unwrap_or(body);

    if let Some(text) = error.as_str() {
        return (Some(text.to_owned()), None);
    }

    let message = error.get("message").and_then(Value::as_str).map(str::to_owned);

    // OpenAI: code, then type. Anthropic: type. Google: status.
    let code = ["code", "type", "status"]
        .iter()
        .find_map(|key| error.get(*key).and_then(Value::as_str))
        .map(str::to_owned);

    (message, code)
}

fn is_context_window(provider_code: Option<&str>, message: &str) -> bool {
    if provider_code == Some("context_length_exceeded") {
        return true;
    }

    let lower = message.to_lowercase();
    if CONTEXT_WINDOW_PATTERNS.iter().any(|p| lower.contains(p)) {
        return true;
    }

    // Google: "The input token count (N) exceeds the maximum ..."
    lower.contains("input token count") && lower.contains("exceeds")
}

fn fallback_message(status: StatusCode, body: &str) -> String {
    let body = body.trim();
    if body.is_empty() {
        format!("provider returned {status}")
    } else {
        format!("provider returned {status}: {body}")
    }
}

fn status_code_name(status: StatusCode) -> &'static str {
    match status.as_u16() {
        401 | 403 => "authentication_error",
        404 => "not_found_error",
        408 => "timeout",
        429 => "rate_limit_error",
        400..=499 => "invalid_request_error",
        _ => "upstream_error",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_openai_error_envelope() {
        let body = r#"{"error":{"message":"Incorrect API key provided","type":"invalid_request_error","code":"invalid_api_key"}}"#;
        let err = ProviderError::from_response(StatusCode::UNAUTHORIZED, body);

        assert_eq!(err.message, "Incorrect API key provided");
        assert_eq!(err.code, "authentication_error");
        assert_eq!(err.http_status, Some(401));
        assert!(!err.is_context_window_error);
    }

    #[test]
    fn detects_openai_context_length_code() {
        let body = r#"{"error":{"message":"This model's maximum context length is 8192 tokens","type":"invalid_request_error","code":"context_length_exceeded"}}"#;
        let err = ProviderError::from_response(StatusCode::BAD_REQUEST, body);

        assert!(err.is_context_window_error);
        assert_eq!(err.code, "context_length_exceeded");
    }

    #[test]
    fn detects_anthropic_prompt_too_long() {
        let body = r#"{"type":"error","error":{"type":"invalid_request_error","message":"prompt is too long: 210000 tokens > 200000 maximum"}}"#;
        let err = ProviderError::from_response(StatusCode::BAD_REQUEST, body);

        assert!(err.is_context_window_error);
        assert!(err.message.starts_with("prompt is too long"));
    }

    #[test]
    fn detects_google_token_count_message() {
        let body = r#"{"error":{"code":400,"message":"The input token count (1200000) exceeds the maximum number of tokens allowed (1048576).","status":"INVALID_ARGUMENT"}}"#;
        let err = ProviderError::from_response(StatusCode::BAD_REQUEST, body);

        assert!(err.is_context_window_error);
    }

    #[test]
    fn maps_statuses_to_codes() {
        let cases = [
            (StatusCode::FORBIDDEN, "authentication_error"),
            (StatusCode::NOT_FOUND, "not_found_error"),
            (StatusCode::REQUEST_TIMEOUT, "timeout"),
            (StatusCode::TOO_MANY_REQUESTS, "rate_limit_error"),
            (StatusCode::UNPROCESSABLE_ENTITY, "invalid_request_error"),
            (StatusCode::SERVICE_UNAVAILABLE, "upstream_error"),
        ];

        for (status, code) in cases {
            assert_eq!(ProviderError::from_response(status, "").code, code, "{status}");
        }
    }

    #[test]
    fn plain_text_body_becomes_message() {
        let err = ProviderError::from_response(StatusCode::BAD_GATEWAY, "upstream connect error");
        assert_eq!(err.message, "provider returned 502 Bad Gateway: upstream connect error");
    }

    #[test]
    fn llm_error_exposes_provider_fields() {
        let err = LlmError::Upstream(ProviderError::from_response(StatusCode::TOO_MANY_REQUESTS, "{}"));
        assert_eq!(err.code(), "rate_limit_error");
        assert_eq!(err.http_status(), Some(429));
        assert!(err.client_message().contains("429"));
    }
}
