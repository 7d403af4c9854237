//! Provider adapters
//!
//! An adapter knows how to turn a [`CompletionRequest`] into an HTTP request
//! for one provider family and how to decode that provider's stream events
//! into [`StreamResult`]s. The core never looks at wire formats directly.

pub mod anthropic;
pub mod google;
pub mod openai;

use std::sync::Arc;

use http::header::{HeaderMap, HeaderName, HeaderValue};
use indexmap::IndexMap;
use secrecy::{ExposeSecret, SecretString};
use synapse_config::{LlmConfig, LlmProviderConfig, LlmProviderType};
use url::Url;

use crate::collector::{Framing, RawEvent};
use crate::error::LlmError;
use crate::types::{CompletionRequest, StreamResult};

/// HTTP request ready to be sent upstream
#[derive(Debug, Clone)]
pub struct PreparedRequest {
    pub url: Url,
    pub method: http::Method,
    pub headers: HeaderMap,
    pub body: serde_json::Value,
}

impl PreparedRequest {
    /// JSON `POST` to `url`
    pub fn post(url: Url, headers: HeaderMap, body: serde_json::Value) -> Self {
        Self {
            url,
            method: http::Method::POST,
            headers,
            body,
        }
    }

    pub(crate) fn into_reqwest(self, client: &reqwest::Client) -> reqwest::RequestBuilder {
        client
            .request(self.method, self.url)
            .headers(self.headers)
            .header(http::header::ACCEPT, "text/event-stream")
            .json(&self.body)
    }
}

/// Translates canonical requests and stream events for one provider family
pub trait ProviderAdapter: Send + Sync {
    /// Configured provider name
    fn name(&self) -> &str;

    /// How the response body is framed
    fn framing(&self) -> Framing;

    /// Build the streamed completion request
    fn build_request(&self, request: &CompletionRequest) -> Result<PreparedRequest, LlmError>;

    /// Fresh decoder for one response stream
    fn decoder(&self) -> Box<dyn StreamDecoder>;
}

/// Converts framed events of a single response into canonical results
///
/// Decoders may keep state across the events of one stream (block indices,
/// tool-call counters); a new decoder is created for every response.
pub trait StreamDecoder: Send {
    fn decode(&mut self, event: &RawEvent, provider: &str) -> StreamResult;
}

/// Connection settings shared by every adapter
#[derive(Debug, Clone)]
pub(crate) struct Endpoint {
    pub(crate) name: String,
    pub(crate) base_url: Url,
    pub(crate) api_key: Option<SecretString>,
    pub(crate) headers: HeaderMap,
    pub(crate) framing: Framing,
}

impl Endpoint {
    pub(crate) fn new(
        name: String,
        config: &LlmProviderConfig,
        default_base_url: &str,
        default_framing: Framing,
    ) -> Result<Self, LlmError> {
        let base_url = match &config.base_url {
            Some(url) => url.clone(),
            None => Url::parse(default_base_url)
                .map_err(|e| LlmError::Internal(anyhow::anyhow!("invalid default base URL: {e}")))?,
        };

        let mut headers = HeaderMap::new();
        for (key, value) in &config.headers {
            let key = HeaderName::from_bytes(key.as_bytes())
                .map_err(|e| LlmError::InvalidRequest(format!("invalid header name '{key}': {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| LlmError::InvalidRequest(format!("invalid value for header '{key}': {e}")))?;
            headers.insert(key, value);
        }

        Ok(Self {
            name,
            base_url,
            api_key: config.api_key.clone(),
            headers,
            framing: config.framing.map_or(default_framing, Framing::from),
        })
    }

    /// `base_url` joined with a path, tolerating a trailing slash on either side
    pub(crate) fn url(&self, path: &str) -> Result<Url, LlmError> {
        let base = self.base_url.as_str().trim_end_matches('/');
        let path = path.trim_start_matches('/');
        Url::parse(&format!("{base}/{path}"))
            .map_err(|e| LlmError::InvalidRequest(format!("invalid upstream URL for '{}': {e}", self.name)))
    }

    /// Static headers plus an API key header, if a key is configured
    pub(crate) fn headers_with_key(&self, header: HeaderName, prefix: &str) -> Result<HeaderMap, LlmError> {
        let mut headers = self.headers.clone();

        if let Some(key) = &self.api_key {
            let mut value = HeaderValue::from_str(&format!("{prefix}{}", key.expose_secret()))
                .map_err(|_| LlmError::InvalidRequest(format!("API key for '{}' is not a valid header", self.name)))?;
            value.set_sensitive(true);
            headers.insert(header, value);
        }

        Ok(headers)
    }
}

/// Adapters keyed by configured provider name
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: IndexMap<String, Arc<dyn ProviderAdapter>>,
}

impl AdapterRegistry {
    /// Build one adapter per configured provider
    ///
    /// # Errors
    ///
    /// Returns an error if a provider has invalid headers or base URL
    pub fn from_config(config: &LlmConfig) -> Result<Self, LlmError> {
        let mut registry = Self::default();

        for (name, provider_config) in &config.providers {
            let adapter: Arc<dyn ProviderAdapter> = match provider_config.provider_type {
                LlmProviderType::Openai => Arc::new(openai::OpenAiAdapter::new(name.clone(), provider_config)?),
                LlmProviderType::Anthropic => {
                    Arc::new(anthropic::AnthropicAdapter::new(name.clone(), provider_config)?)
                }
                LlmProviderType::Google => Arc::new(google::GoogleAdapter::new(name.clone(), provider_config)?),
            };

            tracing::debug!(provider = %name, framing = ?adapter.framing(), "registered provider adapter");
            registry.insert(adapter);
        }

        Ok(registry)
    }

    /// Register an adapter under its own name, replacing any previous one
    pub fn insert(&mut self, adapter: Arc<dyn ProviderAdapter>) {
        self.adapters.insert(adapter.name().to_owned(), adapter);
    }

    /// Look up an adapter by provider name
    ///
    /// # Errors
    ///
    /// Returns [`LlmError::ProviderNotFound`] for unknown names
    pub fn get(&self, provider: &str) -> Result<Arc<dyn ProviderAdapter>, LlmError> {
        self.adapters
            .get(provider)
            .cloned()
            .ok_or_else(|| LlmError::ProviderNotFound {
                provider: provider.to_owned(),
            })
    }

    /// Provider names in configuration order
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.adapters.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(toml: &str) -> LlmConfig {
        toml::from_str(toml).unwrap()
    }

    #[test]
    fn builds_adapters_in_configuration_order() {
        let registry = AdapterRegistry::from_config(&config(
            r#"
            [providers.gpt]
            type = "openai"
            api_key = "sk"

            [providers.claude]
            type = "anthropic"
            api_key = "sk-ant"

            [providers.gemini]
            type = "google"
            api_key = "g"
            framing = "json_blocks"
            "#,
        ))
        .unwrap();

        assert_eq!(registry.names().collect::<Vec<_>>(), ["gpt", "claude", "gemini"]);
        assert_eq!(registry.get("gpt").unwrap().framing(), Framing::Sse);
        assert_eq!(registry.get("gemini").unwrap().framing(), Framing::JsonBlocks);
    }

    #[test]
    fn unknown_provider_is_not_found() {
        let registry = AdapterRegistry::default();
        let err = registry.get("missing").err().unwrap();
        assert!(matches!(err, LlmError::ProviderNotFound { provider } if provider == "missing"));
    }

    #[test]
    fn rejects_invalid_static_header() {
        let result = AdapterRegistry::from_config(&config(
            r#"
            [providers.gpt]
            type = "openai"
            api_key = "sk"

            [providers.gpt.headers]
            "bad header" = "x"
            "#,
        ));
        assert!(matches!(result, Err(LlmError::InvalidRequest(_))));
    }

    #[test]
    fn endpoint_url_joins_paths() {
        let endpoint = Endpoint::new(
            "x".to_owned(),
            &config(
                r#"
                [providers.x]
                type = "openai"
                base_url = "http://localhost:8080/v1/"
                "#,
            )
            .providers["x"],
            "https://unused.example",
            Framing::Sse,
        )
        .unwrap();

        assert_eq!(endpoint.url("/chat/completions").unwrap().as_str(), "http://localhost:8080/v1/chat/completions");
    }
}
