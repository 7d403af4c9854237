//! Streamed response collection
//!
//! [`StreamCollector`] drives one upstream response body to completion:
//! framing, provider decoding, tool-call accumulation and callback dispatch.
//! It stops early when the provider reports an error or when the turn's
//! cancellation token fires; dropping the body stream aborts the upstream
//! connection.

pub mod framing;

use std::sync::Arc;

use futures_util::StreamExt;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

pub use self::framing::{ByteStream, EventStream, Framing, RawEvent, frame, response_body};
use crate::accumulator::ToolCallAccumulator;
use crate::error::{LlmError, ProviderError};
use crate::provider::ProviderAdapter;
use crate::types::{FinishReason, ImageFragment, ToolCall, Usage};

/// Receives decoded output while a response is streaming
///
/// Every method defaults to doing nothing.
pub trait StreamCallbacks: Send {
    fn on_content(&mut self, _text: &str) {}

    fn on_thinking(&mut self, _text: &str) {}

    fn on_image(&mut self, _image: &ImageFragment) {}

    fn on_grounding(&mut self, _metadata: &Value) {}
}

impl StreamCallbacks for () {}

/// How the collection loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectStatus {
    /// The provider signalled the end of the response
    Completed,
    /// The body ended without a terminal event
    EndOfStream,
    /// The cancellation token fired
    Cancelled,
}

/// Everything gathered from one response
#[derive(Debug, Clone, PartialEq)]
pub struct CollectedResponse {
    pub content: String,
    pub thinking: String,
    /// Merged tool calls in order of first appearance
    pub tool_calls: Vec<ToolCall>,
    pub thought_signatures: Vec<String>,
    pub finish_reason: Option<FinishReason>,
    pub usage: Option<Usage>,
    pub grounding_metadata: Option<Value>,
    pub status: CollectStatus,
}

/// Drives one streamed response for a provider adapter
pub struct StreamCollector {
    adapter: Arc<dyn ProviderAdapter>,
    cancel: CancellationToken,
}

impl StreamCollector {
    pub fn new(adapter: Arc<dyn ProviderAdapter>, cancel: CancellationToken) -> Self {
        Self { adapter, cancel }
    }

    /// Collect a response, forwarding content and side channels to `callbacks`
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure, malformed payloads, or an
    /// error reported by the provider inside the stream
    pub async fn process(
        &self,
        response: reqwest::Response,
        callbacks: &mut dyn StreamCallbacks,
    ) -> Result<CollectedResponse, LlmError> {
        self.process_stream(response_body(response), callbacks).await
    }

    /// Collect a response, forwarding only side channels (thinking, images,
    /// grounding) to `callbacks`
    ///
    /// # Errors
    ///
    /// Same as [`StreamCollector::process`]
    pub async fn collect(
        &self,
        response: reqwest::Response,
        callbacks: Option<&mut dyn StreamCallbacks>,
    ) -> Result<CollectedResponse, LlmError> {
        self.collect_stream(response_body(response), callbacks).await
    }

    /// [`StreamCollector::process`] over an arbitrary body stream
    ///
    /// # Errors
    ///
    /// Same as [`StreamCollector::process`]
    pub async fn process_stream(
        &self,
        body: ByteStream,
        callbacks: &mut dyn StreamCallbacks,
    ) -> Result<CollectedResponse, LlmError> {
        self.drive(body, callbacks, true).await
    }

    /// [`StreamCollector::collect`] over an arbitrary body stream
    ///
    /// # Errors
    ///
    /// Same as [`StreamCollector::process`]
    pub async fn collect_stream(
        &self,
        body: ByteStream,
        callbacks: Option<&mut dyn StreamCallbacks>,
    ) -> Result<CollectedResponse, LlmError> {
        match callbacks {
            Some(callbacks) => self.drive(body, callbacks, false).await,
            None => self.drive(body, &mut (), false).await,
        }
    }

    async fn drive(
        &self,
        body: ByteStream,
        callbacks: &mut dyn StreamCallbacks,
        forward_content: bool,
    ) -> Result<CollectedResponse, LlmError> {
        let provider = self.adapter.name();
        let mut events = frame(body, self.adapter.framing());
        let mut decoder = self.adapter.decoder();

        let mut content = String::new();
        let mut thinking = String::new();
        let mut tool_calls = ToolCallAccumulator::new();
        let mut finish_reason = None;
        let mut usage = None;
        let mut grounding_metadata = None;

        let status = loop {
            let next = tokio::select! {
                biased;
                () = self.cancel.cancelled() => break CollectStatus::Cancelled,
                next = events.next() => next,
            };

            let Some(event) = next else {
                break if finish_reason.is_some() {
                    CollectStatus::Completed
                } else {
                    CollectStatus::EndOfStream
                };
            };

            let result = decoder.decode(&event?, provider);

            if result.error {
                let message = result
                    .error_message
                    .unwrap_or_else(|| "provider stream failed".to_owned());
                tracing::warn!(provider = %provider, error = %message, code = ?result.error_code, "error inside response stream");

                return Err(match result.error_code {
                    Some(code) => LlmError::Upstream(ProviderError::in_stream(message, Some(&code))),
                    None => LlmError::Streaming(message),
                });
            }

            for fragment in &result.content {
                if forward_content {
                    callbacks.on_content(fragment);
                }
                content.push_str(fragment);
            }

            for fragment in &result.thinking {
                callbacks.on_thinking(fragment);
                thinking.push_str(fragment);
            }

            for image in &result.images {
                callbacks.on_image(image);
            }

            if let Some(grounding) = result.grounding_metadata {
                callbacks.on_grounding(&grounding);
                grounding_metadata = Some(grounding);
            }

            tool_calls.merge(&result.tool_calls);

            if result.usage.is_some() {
                usage = result.usage;
            }
            if result.finish_reason.is_some() {
                finish_reason = result.finish_reason;
            }

            if result.complete {
                break CollectStatus::Completed;
            }
        };

        tracing::debug!(
            provider = %provider,
            status = ?status,
            finish_reason = ?finish_reason,
            tool_calls = tool_calls.calls().len(),
            "response stream finished"
        );

        Ok(CollectedResponse {
            content,
            thinking,
            thought_signatures: tool_calls.thought_signatures(),
            tool_calls: tool_calls.into_calls(),
            finish_reason,
            usage,
            grounding_metadata,
            status,
        })
    }
}
