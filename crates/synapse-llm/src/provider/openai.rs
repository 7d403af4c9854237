//! OpenAI-compatible provider adapter

use http::header::AUTHORIZATION;
use synapse_config::LlmProviderConfig;
use url::Url;

use super::{Endpoint, PreparedRequest, ProviderAdapter, StreamDecoder};
use crate::collector::Framing;
use crate::convert::openai::OpenAiDecoder;
use crate::error::LlmError;
use crate::protocol::openai::{OpenAiRequest, OpenAiStreamOptions};
use crate::types::CompletionRequest;

/// Default `OpenAI` API base URL
const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Whether the provider is the canonical `OpenAI` API (vs a compatible third-party)
fn is_canonical_openai(base_url: &Url) -> bool {
    base_url.host_str().is_some_and(|h| h == "api.openai.com")
}

/// OpenAI-compatible provider
pub struct OpenAiAdapter {
    endpoint: Endpoint,
}

impl OpenAiAdapter {
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

impl ProviderAdapter for OpenAiAdapter {
    fn name(&self) -> &str {
        &self.endpoint.name
    }

    fn framing(&self) -> Framing {
        self.endpoint.framing
    }

    fn build_request(&self, request: &CompletionRequest) -> Result<PreparedRequest, LlmError> {
        let mut wire = OpenAiRequest::from(request);

        // Compatible servers commonly reject stream_options
        if is_canonical_openai(&self.endpoint.base_url) {
            wire.stream_options = Some(OpenAiStreamOptions { include_usage: true });
        }

        let body = serde_json::to_value(&wire).map_err(|e| LlmError::Internal(e.into()))?;

        Ok(PreparedRequest::post(
            self.endpoint.url("chat/completions")?,
            self.endpoint.headers_with_key(AUTHORIZATION, "Bearer ")?,
            body,
        ))
    }

    fn decoder(&self) -> Box<dyn StreamDecoder> {
        Box::new(OpenAiDecoder)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Message;

    fn adapter(toml: &str) -> OpenAiAdapter {
        let config: LlmProviderConfig = toml::from_str(toml).unwrap();
        OpenAiAdapter::new("gpt".to_owned(), &config).unwrap()
    }

    #[test]
    fn canonical_api_requests_usage() {
        let adapter = adapter(
            r#"
            type = "openai"
            api_key = "sk-test"
            "#,
        );
        let prepared = adapter
            .build_request(&CompletionRequest::new("gpt-4o", vec![Message::user("hi")]))
            .unwrap();

        assert_eq!(prepared.url.as_str(), "https://api.openai.com/v1/chat/completions");
        assert_eq!(prepared.headers[AUTHORIZATION], "Bearer sk-test");
        assert!(prepared.headers[AUTHORIZATION].is_sensitive());
        assert_eq!(prepared.body["stream"], true);
        assert_eq!(prepared.body["stream_options"]["include_usage"], true);
    }

    #[test]
    fn compatible_server_without_key() {
        let adapter = adapter(
            r#"
            type = "openai"
            base_url = "http://localhost:11434/v1"

            [headers]
            x-tenant = "acme"
            "#,
        );
        let prepared = adapter
            .build_request(&CompletionRequest::new("llama3", vec![Message::user("hi")]))
            .unwrap();

        assert_eq!(prepared.url.as_str(), "http://localhost:11434/v1/chat/completions");
        assert!(prepared.headers.get(AUTHORIZATION).is_none());
        assert_eq!(prepared.headers["x-tenant"], "acme");
        assert!(prepared.body.get("stream_options").is_none());
    }
}
