//! Anthropic Messages API adapter

use http::header::{HeaderName, HeaderValue};
use synapse_config::LlmProviderConfig;

use super::{Endpoint, PreparedRequest, ProviderAdapter, StreamDecoder};
use crate::collector::Framing;
use crate::convert::anthropic::AnthropicStreamState;
use crate::error::LlmError;
use crate::protocol::anthropic::AnthropicRequest;
use crate::types::CompletionRequest;

/// Default Anthropic API base URL
const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1";

/// Anthropic API version header value
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Anthropic provider
pub struct AnthropicAdapter {
    endpoint: Endpoint,
}

impl AnthropicAdapter {
    /// Create from provider configuration
    ///
    /// # Errors
    ///
    /// Returns an error if the configured headers are invalid
    pub fn new(name: String, config: &LlmProviderConfig) -> Result<Self, LlmError> {
        Ok(Self {
            endpoint: Endpoint::new(name, config, DEFAULT_BASE_URL, Framing::Sse)?,
        })
    }
}

impl ProviderAdapter for AnthropicAdapter {
    fn name(&self) -> &str {
        &self.endpoint.name
    }

    fn framing(&self) -> Framing {
        self.endpoint.framing
    }

    fn build_request(&self, request: &CompletionRequest) -> Result<PreparedRequest, LlmError> {
        let wire = AnthropicRequest::from(request);
        let body = serde_json::to_value(&wire).map_err(|e| LlmError::Internal(e.into()))?;

        let mut headers = self
            .endpoint
            .headers_with_key(HeaderName::from_static("x-api-key"), "")?;
        headers
            .entry(HeaderName::from_static("anthropic-version"))
            .or_insert(HeaderValue::from_static(ANTHROPIC_VERSION));

        Ok(PreparedRequest::post(self.endpoint.url("messages")?, headers, body))
    }

    fn decoder(&self) -> Box<dyn StreamDecoder> {
        Box::new(AnthropicStreamState::new())
    }
}
