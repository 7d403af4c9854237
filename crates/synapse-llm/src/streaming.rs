//! Tool-free streaming turns
//!
//! Content, thinking, images and grounding are forwarded to the client as
//! they arrive. Every turn ends with exactly one `done` event unless a newer
//! turn for the same conversation superseded it.

use std::sync::Arc;

use crate::collector::{CollectStatus, CollectedResponse, StreamCollector};
use crate::error::LlmError;
use crate::events::ClientEvent;
use crate::lifecycle::RequestLifecycle;
use crate::state::ChatState;
use crate::turn::{EventForwarder, Interruption, TurnEvents, TurnRequest};
use crate::types::{FinishReason, Usage};

/// Terminal state of a streaming turn
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Done,
    Failed,
    Cancelled,
    Superseded,
    TimedOut,
}

impl From<Interruption> for StreamState {
    fn from(value: Interruption) -> Self {
        match value {
            Interruption::Superseded => Self::Superseded,
            Interruption::TimedOut => Self::TimedOut,
            Interruption::Cancelled => Self::Cancelled,
        }
    }
}

/// Result of a streaming turn
#[derive(Debug)]
pub struct StreamOutcome {
    pub state: StreamState,
    /// Content received before the turn ended
    pub content: String,
    pub finish_reason: FinishReason,
    pub usage: Option<Usage>,
    /// The failure reported to the client, for [`StreamState::Failed`]
    pub error: Option<LlmError>,
}

impl StreamOutcome {
    fn interrupted(interruption: Interruption, collected: Option<CollectedResponse>) -> Self {
        let (content, usage) = collected.map_or_else(Default::default, |c| (c.content, c.usage));

        Self {
            state: StreamState::from(interruption),
            content,
            finish_reason: interruption.finish_reason(),
            usage,
            error: None,
        }
    }
}

/// Runs single-response turns without tools
#[derive(Clone)]
pub struct StreamingHandler {
    state: ChatState,
}

impl StreamingHandler {
    pub const fn new(state: ChatState) -> Self {
        Self { state }
    }

    /// Run one turn to completion
    ///
    /// Failures are reported to the client and reflected in the outcome
    /// rather than returned.
    pub async fn run(&self, turn: TurnRequest) -> StreamOutcome {
        let events = TurnEvents::new(&turn.conversation_id, Arc::clone(self.state.sink()));
        let settings = self.state.settings();

        let lifecycle = self.state.lifecycles().begin(
            &turn.conversation_id,
            settings.request_timeout,
            Some(events.timeout_callback(&settings.timeout_message)),
        );

        tracing::debug!(
            conversation_id = %turn.conversation_id,
            provider = %turn.provider,
            model = %turn.request.model,
            "streaming turn started"
        );
        events.emit(ClientEvent::Processing { message: None });

        let result = self.stream(&turn, &lifecycle, &events).await;
        self.state.lifecycles().end(&lifecycle);

        let outcome = settle(result, &lifecycle, &events);
        tracing::debug!(
            conversation_id = %turn.conversation_id,
            state = ?outcome.state,
            finish_reason = %outcome.finish_reason,
            "streaming turn finished"
        );
        outcome
    }

    async fn stream(
        &self,
        turn: &TurnRequest,
        lifecycle: &RequestLifecycle,
        events: &TurnEvents,
    ) -> Result<CollectedResponse, LlmError> {
        let adapter = self.state.adapters().get(&turn.provider)?;
        let response = self
            .state
            .open_stream(adapter.as_ref(), &turn.request, lifecycle.token())
            .await?;

        let collector = StreamCollector::new(adapter, lifecycle.token().clone());
        collector.process(response, &mut EventForwarder::new(events)).await
    }
}

fn settle(
    result: Result<CollectedResponse, LlmError>,
    lifecycle: &RequestLifecycle,
    events: &TurnEvents,
) -> StreamOutcome {
    match result {
        Ok(collected) => match collected.status {
            CollectStatus::Completed => {
                let finish_reason = collected.finish_reason.unwrap_or(FinishReason::Stop);
                events.done(finish_reason);
                StreamOutcome {
                    state: StreamState::Done,
                    content: collected.content,
                    finish_reason,
                    usage: collected.usage,
                    error: None,
                }
            }
            CollectStatus::EndOfStream => {
                tracing::warn!(
                    conversation_id = %events.conversation_id(),
                    "response ended without a terminal event"
                );
                events.done(FinishReason::ConnectionClosed);
                StreamOutcome {
                    state: StreamState::Done,
                    content: collected.content,
                    finish_reason: FinishReason::ConnectionClosed,
                    usage: collected.usage,
                    error: None,
                }
            }
            CollectStatus::Cancelled => StreamOutcome::interrupted(events.interrupted(lifecycle), Some(collected)),
        },
        Err(LlmError::Cancelled) => StreamOutcome::interrupted(events.interrupted(lifecycle), None),
        // transport errors caused by an abort are not failures
        Err(_) if lifecycle.token().is_cancelled() => StreamOutcome::interrupted(events.interrupted(lifecycle), None),
        Err(error) => {
            tracing::warn!(
                conversation_id = %events.conversation_id(),
                code = %error.code(),
                error = %error,
                "streaming turn failed"
            );
            let finish_reason = events.fail(&error);
            StreamOutcome {
                state: StreamState::Failed,
                content: String::new(),
                finish_reason,
                usage: None,
                error: Some(error),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use synapse_config::LlmConfig;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::events::testing::RecordingSink;
    use crate::provider::AdapterRegistry;
    use crate::state::ChatSettings;
    use crate::types::{CompletionRequest, Message};

    fn sse(events: &[&str]) -> ResponseTemplate {
        let body: String = events.iter().map(|e| format!("data: {e}\n\n")).collect();
        ResponseTemplate::new(200)
            .insert_header("content-type", "text/event-stream")
            .set_body_string(body)
    }

    fn chunk(text: &str) -> String {
        serde_json::json!({"choices": [{"index": 0, "delta": {"content": text}}]}).to_string()
    }

    fn handler(providers: &[(&str, &MockServer)], timeout: Duration) -> (StreamingHandler, Arc<RecordingSink>) {
        let tables: String = providers
            .iter()
            .map(|(name, server)| {
                format!(
                    "[providers.{name}]\ntype = \"openai\"\napi_key = \"sk\"\nbase_url = \"{}\"\n",
                    server.uri()
                )
            })
            .collect();
        let config: LlmConfig = toml::from_str(&tables).unwrap();

        let sink = Arc::new(RecordingSink::default());
        let state = ChatState::new(
            AdapterRegistry::from_config(&config).unwrap(),
            sink.clone(),
            ChatSettings {
                request_timeout: timeout,
                ..ChatSettings::default()
            },
        );
        (StreamingHandler::new(state), sink)
    }

    fn turn(provider: &str) -> TurnRequest {
        TurnRequest::new("conv-1", provider, CompletionRequest::new("gpt-4o", vec![Message::user("hi")]))
    }

    fn done_count(sink: &RecordingSink) -> usize {
        sink.count(ClientEvent::is_terminal)
    }

    #[tokio::test]
    async fn streams_chunks_then_done() {
        let server = MockServer::start().await;
        let stop = r#"{"choices":[{"index":0,"delta":{},"finish_reason":"stop"}]}"#;
        Mock::given(method("POST"))
            .respond_with(sse(&[&chunk("Hel"), &chunk("lo"), stop, "[DONE]"]))
            .mount(&server)
            .await;

        let (handler, sink) = handler(&[("gpt", &server)], Duration::from_secs(10));
        let outcome = handler.run(turn("gpt")).await;

        assert_eq!(outcome.state, StreamState::Done);
        assert_eq!(outcome.content, "Hello");
        assert_eq!(
            sink.events(),
            [
                ClientEvent::Processing { message: None },
                ClientEvent::chunk("Hel"),
                ClientEvent::chunk("lo"),
                ClientEvent::done(FinishReason::Stop),
            ]
        );
    }

    #[tokio::test]
    async fn completion_before_content_sends_single_done() {
        let server = MockServer::start().await;
        Mock::given(method("POST")).respond_with(sse(&["[DONE]"])).mount(&server).await;

        let (handler, sink) = handler(&[("gpt", &server)], Duration::from_secs(10));
        let outcome = handler.run(turn("gpt")).await;

        assert_eq!(outcome.finish_reason, FinishReason::Stop);
        assert_eq!(done_count(&sink), 1);
        assert_eq!(sink.count(|e| matches!(e, ClientEvent::Chunk { .. })), 0);
    }

    #[tokio::test]
    async fn upstream_error_reports_error_then_done() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "error": {"message": "prompt is too long: 210000 tokens > 200000 maximum", "type": "invalid_request_error"}
            })))
            .mount(&server)
            .await;

        let (handler, sink) = handler(&[("gpt", &server)], Duration::from_secs(10));
        let outcome = handler.run(turn("gpt")).await;

        assert_eq!(outcome.state, StreamState::Failed);
        let events = sink.events();
        assert!(matches!(
            &events[1],
            ClientEvent::Error { code, http_status: Some(400), is_context_window_error: Some(true), .. }
                if code == "context_length_exceeded"
        ));
        assert_eq!(events[2], ClientEvent::done(FinishReason::ConnectionClosed));
        assert_eq!(outcome.finish_reason, FinishReason::ConnectionClosed);
        assert_eq!(done_count(&sink), 1);
    }

    #[tokio::test]
    async fn server_error_ends_with_connection_closed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_json(serde_json::json!({
                "error": {"message": "internal failure", "type": "server_error"}
            })))
            .mount(&server)
            .await;

        let (handler, sink) = handler(&[("gpt", &server)], Duration::from_secs(10));
        let outcome = handler.run(turn("gpt")).await;

        assert_eq!(outcome.state, StreamState::Failed);
        assert_eq!(outcome.finish_reason, FinishReason::ConnectionClosed);
        let events = sink.events();
        assert_eq!(events.len(), 3);
        assert!(matches!(&events[1], ClientEvent::Error { http_status: Some(500), .. }));
        assert_eq!(events[2], ClientEvent::done(FinishReason::ConnectionClosed));
    }

    #[tokio::test]
    async fn truncated_body_closes_connection() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(sse(&[&chunk("partial")]))
            .mount(&server)
            .await;

        let (handler, sink) = handler(&[("gpt", &server)], Duration::from_secs(10));
        let outcome = handler.run(turn("gpt")).await;

        assert_eq!(outcome.finish_reason, FinishReason::ConnectionClosed);
        assert_eq!(sink.events().last(), Some(&ClientEvent::done(FinishReason::ConnectionClosed)));
    }

    #[tokio::test]
    async fn unknown_provider_fails_turn() {
        let server = MockServer::start().await;
        let (handler, sink) = handler(&[("gpt", &server)], Duration::from_secs(10));

        let outcome = handler.run(turn("missing")).await;

        assert_eq!(outcome.state, StreamState::Failed);
        assert!(matches!(outcome.error, Some(LlmError::ProviderNotFound { .. })));
        assert_eq!(done_count(&sink), 1);
    }

    #[tokio::test]
    async fn timeout_reports_error_and_done() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(sse(&["[DONE]"]).set_delay(Duration::from_secs(5)))
            .mount(&server)
            .await;

        let (handler, sink) = handler(&[("gpt", &server)], Duration::from_millis(100));
        let outcome = handler.run(turn("gpt")).await;

        assert_eq!(outcome.state, StreamState::TimedOut);
        let events = sink.events();
        assert!(matches!(&events[1], ClientEvent::Error { code, .. } if code == "timeout"));
        assert_eq!(events[2], ClientEvent::done(FinishReason::ConnectionClosed));
        assert_eq!(outcome.finish_reason, FinishReason::ConnectionClosed);
        assert_eq!(events.len(), 3);
    }

    #[tokio::test]
    async fn newer_turn_supersedes_older() {
        let slow = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(sse(&[&chunk("stale"), "[DONE]"]).set_delay(Duration::from_secs(5)))
            .mount(&slow)
            .await;
        let fast = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(sse(&[&chunk("fresh"), "[DONE]"]))
            .mount(&fast)
            .await;

        let (handler, sink) = handler(&[("slow", &slow), ("fast", &fast)], Duration::from_secs(30));

        let first = tokio::spawn({
            let handler = handler.clone();
            async move { handler.run(turn("slow")).await }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;

        let second = handler.run(turn("fast")).await;
        let first = first.await.unwrap();

        assert_eq!(first.state, StreamState::Superseded);
        assert_eq!(second.state, StreamState::Done);
        assert_eq!(done_count(&sink), 1);
        assert_eq!(sink.count(|e| *e == ClientEvent::chunk("stale")), 0);
    }

    #[tokio::test]
    async fn explicit_cancel_closes_connection() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(sse(&["[DONE]"]).set_delay(Duration::from_secs(5)))
            .mount(&server)
            .await;

        let (handler, sink) = handler(&[("gpt", &server)], Duration::from_secs(30));
        let lifecycles = handler.state.lifecycles().clone();

        let running = tokio::spawn({
            let handler = handler.clone();
            async move { handler.run(turn("gpt")).await }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(lifecycles.cancel("conv-1"));

        let outcome = running.await.unwrap();
        assert_eq!(outcome.state, StreamState::Cancelled);
        assert_eq!(sink.events().last(), Some(&ClientEvent::done(FinishReason::ConnectionClosed)));
    }
}
