//! Shared conversation state: provider adapters, lifecycles, event sink

use std::sync::Arc;
use std::time::Duration;

use synapse_config::{ChatConfig, LlmConfig};
use tokio_util::sync::CancellationToken;

use crate::error::{LlmError, ProviderError};
use crate::events::EventSink;
use crate::lifecycle::LifecycleRegistry;
use crate::provider::{AdapterRegistry, ProviderAdapter};
use crate::types::CompletionRequest;

/// Turn settings resolved from `[llm.chat]`
#[derive(Debug, Clone)]
pub struct ChatSettings {
    /// Time limit for one upstream call, reset at every tool round
    pub request_timeout: Duration,
    /// Upper bound on model rounds in one tool loop
    pub max_iterations: u32,
    /// User-facing message sent when a request times out
    pub timeout_message: String,
}

impl ChatSettings {
    /// Resolve settings from configuration
    ///
    /// # Errors
    ///
    /// Returns an error if the timeout is not a valid duration
    pub fn from_config(config: &ChatConfig) -> Result<Self, LlmError> {
        Ok(Self {
            request_timeout: config.request_timeout()?,
            max_iterations: config.max_iterations,
            timeout_message: config.timeout_message.clone(),
        })
    }
}

impl Default for ChatSettings {
    fn default() -> Self {
        let config = ChatConfig::default();
        Self {
            request_timeout: config.request_timeout().unwrap_or(Duration::from_secs(120)),
            max_iterations: config.max_iterations,
            timeout_message: config.timeout_message,
        }
    }
}

/// Shared state for conversation turns
#[derive(Clone)]
pub struct ChatState {
    pub(crate) inner: Arc<ChatStateInner>,
}

pub(crate) struct ChatStateInner {
    pub(crate) adapters: AdapterRegistry,
    pub(crate) lifecycles: LifecycleRegistry,
    pub(crate) sink: Arc<dyn EventSink>,
    pub(crate) client: reqwest::Client,
    pub(crate) settings: ChatSettings,
}

impl ChatState {
    pub fn new(adapters: AdapterRegistry, sink: Arc<dyn EventSink>, settings: ChatSettings) -> Self {
        Self {
            inner: Arc::new(ChatStateInner {
                adapters,
                lifecycles: LifecycleRegistry::new(),
                sink,
                client: reqwest::Client::new(),
                settings,
            }),
        }
    }

    /// Build state from configuration, constructing one adapter per provider
    ///
    /// # Errors
    ///
    /// Returns an error if any provider or the chat settings are invalid
    pub fn from_config(config: &LlmConfig, sink: Arc<dyn EventSink>) -> Result<Self, LlmError> {
        let adapters = AdapterRegistry::from_config(config)?;
        let settings = ChatSettings::from_config(&config.chat)?;

        tracing::debug!(
            providers = adapters.len(),
            request_timeout = ?settings.request_timeout,
            max_iterations = settings.max_iterations,
            "chat state initialized"
        );

        Ok(Self::new(adapters, sink, settings))
    }

    pub fn adapters(&self) -> &AdapterRegistry {
        &self.inner.adapters
    }

    pub fn lifecycles(&self) -> &LifecycleRegistry {
        &self.inner.lifecycles
    }

    pub fn settings(&self) -> &ChatSettings {
        &self.inner.settings
    }

    pub fn sink(&self) -> &Arc<dyn EventSink> {
        &self.inner.sink
    }

    /// Send a streamed completion request upstream
    ///
    /// Non-success responses are read to completion and translated into
    /// [`LlmError::Upstream`]. Returns [`LlmError::Cancelled`] if `cancel`
    /// fires before the response headers arrive.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure, non-success status, or cancellation
    pub async fn open_stream(
        &self,
        adapter: &dyn ProviderAdapter,
        request: &CompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<reqwest::Response, LlmError> {
        let prepared = adapter.build_request(request)?;
        tracing::debug!(provider = %adapter.name(), model = %request.model, url = %prepared.url, "sending streamed request");

        let send = prepared.into_reqwest(&self.inner.client).send();

        let response = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(LlmError::Cancelled),
            response = send => response?,
        };

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(LlmError::Cancelled),
            body = response.text() => body.unwrap_or_default(),
        };

        let error = ProviderError::from_response(status, &body);
        tracing::warn!(
            provider = %adapter.name(),
            status = status.as_u16(),
            code = %error.code,
            "provider returned error status"
        );

        Err(LlmError::Upstream(error))
    }
}

#[cfg(test)]
mod tests {
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::events::testing::RecordingSink;
    use crate::types::Message;

    fn state_for(server: &MockServer) -> ChatState {
        let config: LlmConfig = toml::from_str(&format!(
            r#"
            [providers.gpt]
            type = "openai"
            api_key = "sk-test"
            base_url = "{}/v1"
            "#,
            server.uri()
        ))
        .unwrap();
        ChatState::from_config(&config, Arc::new(RecordingSink::default())).unwrap()
    }

    fn request() -> CompletionRequest {
        CompletionRequest::new("gpt-4o", vec![Message::user("hi")])
    }

    #[tokio::test]
    async fn successful_response_is_returned_for_streaming() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string("data: [DONE]\n\n"),
            )
            .expect(1)
            .mount(&server)
            .await;

        let state = state_for(&server);
        let adapter = state.adapters().get("gpt").unwrap();

        let response = state
            .open_stream(adapter.as_ref(), &request(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
    }

    #[tokio::test]
    async fn error_status_is_translated() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).set_body_json(serde_json::json!({
                "error": {"message": "Rate limit reached", "type": "requests", "code": "rate_limit_exceeded"}
            })))
            .mount(&server)
            .await;

        let state = state_for(&server);
        let adapter = state.adapters().get("gpt").unwrap();

        let err = state
            .open_stream(adapter.as_ref(), &request(), &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(err.code(), "rate_limit_error");
        assert_eq!(err.http_status(), Some(429));
        assert_eq!(err.client_message(), "Rate limit reached");
    }

    #[tokio::test]
    async fn cancelled_before_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(30)))
            .mount(&server)
            .await;

        let state = state_for(&server);
        let adapter = state.adapters().get("gpt").unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = state
            .open_stream(adapter.as_ref(), &request(), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::Cancelled));
    }
}
