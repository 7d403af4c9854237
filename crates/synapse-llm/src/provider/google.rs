//! Google Generative Language API adapter

use http::header::HeaderName;
use synapse_config::LlmProviderConfig;

use super::{Endpoint, PreparedRequest, ProviderAdapter, StreamDecoder};
use crate::collector::Framing;
use crate::convert::google::GoogleDecoder;
use crate::error::LlmError;
use crate::protocol::google::GoogleRequest;
use crate::types::CompletionRequest;

/// Default Google Generative Language API base URL
const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Google Gemini provider
pub struct GoogleAdapter {
    endpoint: Endpoint,
}

impl GoogleAdapter {
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

impl ProviderAdapter for GoogleAdapter {
    fn name(&self) -> &str {
        &self.endpoint.name
    }

    fn framing(&self) -> Framing {
        self.endpoint.framing
    }

    fn build_request(&self, request: &CompletionRequest) -> Result<PreparedRequest, LlmError> {
        if request.model.is_empty() || request.model.contains('/') {
            return Err(LlmError::InvalidRequest(format!("invalid model name '{}'", request.model)));
        }

        let mut url = self
            .endpoint
            .url(&format!("models/{}:streamGenerateContent", request.model))?;
        if self.endpoint.framing == Framing::Sse {
            url.query_pairs_mut().append_pair("alt", "sse");
        }

        let wire = GoogleRequest::from(request);
        let body = serde_json::to_value(&wire).map_err(|e| LlmError::Internal(e.into()))?;

        Ok(PreparedRequest::post(
            url,
            self.endpoint
                .headers_with_key(HeaderName::from_static("x-goog-api-key"), "")?,
            body,
        ))
    }

    fn decoder(&self) -> Box<dyn StreamDecoder> {
        Box::new(GoogleDecoder::new())
    }
}
