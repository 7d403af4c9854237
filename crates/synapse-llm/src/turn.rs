//! Per-turn request and event bookkeeping shared by the streaming handler
//! and the tool executor

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures_util::FutureExt;
use serde_json::Value;

use crate::collector::StreamCallbacks;
use crate::error::LlmError;
use crate::events::{ClientEvent, EventSink};
use crate::lifecycle::{LifecycleState, RequestLifecycle, TimeoutCallback};
use crate::types::{CompletionRequest, FinishReason, ImageFragment};

/// One conversation turn to run against a provider
#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub conversation_id: String,
    /// End user on whose behalf tools run
    pub user_id: Option<String>,
    /// Configured provider name
    pub provider: String,
    pub request: CompletionRequest,
}

impl TurnRequest {
    pub fn new(conversation_id: impl Into<String>, provider: impl Into<String>, request: CompletionRequest) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            user_id: None,
            provider: provider.into(),
            request,
        }
    }

    #[must_use]
    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }
}

/// How a turn ended when its token was cancelled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Interruption {
    Superseded,
    TimedOut,
    Cancelled,
}

impl Interruption {
    /// Finish reason of the `done` synthesized for an interrupted turn
    pub(crate) const fn finish_reason(self) -> FinishReason {
        match self {
            Self::Superseded | Self::TimedOut | Self::Cancelled => FinishReason::ConnectionClosed,
        }
    }
}

/// Publishes a turn's events and guarantees at most one terminal event
///
/// Clones share the same guard, so the timeout callback and the driving
/// task cannot both finish the turn.
#[derive(Clone)]
pub(crate) struct TurnEvents {
    conversation_id: Arc<str>,
    sink: Arc<dyn EventSink>,
    done_sent: Arc<AtomicBool>,
    error_sent: Arc<AtomicBool>,
}

impl TurnEvents {
    pub(crate) fn new(conversation_id: &str, sink: Arc<dyn EventSink>) -> Self {
        Self {
            conversation_id: Arc::from(conversation_id),
            sink,
            done_sent: Arc::new(AtomicBool::new(false)),
            error_sent: Arc::new(AtomicBool::new(false)),
        }
    }

    pub(crate) fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub(crate) fn sink(&self) -> &Arc<dyn EventSink> {
        &self.sink
    }

    /// Publish a non-terminal event unless the turn is already finished
    pub(crate) fn emit(&self, event: ClientEvent) {
        if self.done_sent.load(Ordering::Acquire) {
            return;
        }
        self.sink.publish(&self.conversation_id, event);
    }

    /// Publish the terminal event; returns false if one was already sent
    pub(crate) fn done(&self, finish_reason: FinishReason) -> bool {
        if self.done_sent.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.sink.publish(&self.conversation_id, ClientEvent::done(finish_reason));
        true
    }

    /// Publish at most one error event per turn
    fn error_event(&self, event: ClientEvent) {
        if self.done_sent.load(Ordering::Acquire) || self.error_sent.swap(true, Ordering::AcqRel) {
            return;
        }
        self.sink.publish(&self.conversation_id, event);
    }

    /// Report a failure and finish the turn
    ///
    /// The turn has no finish reason of its own, so the closing `done` is
    /// synthesized as `connection_closed`, which is also returned.
    pub(crate) fn fail(&self, error: &LlmError) -> FinishReason {
        self.error_event(ClientEvent::from_error(error));
        self.done(FinishReason::ConnectionClosed);
        FinishReason::ConnectionClosed
    }

    /// Stop publishing anything for this turn
    pub(crate) fn silence(&self) {
        self.done_sent.store(true, Ordering::Release);
    }

    /// Callback for the lifecycle timer that reports the timeout to the client
    pub(crate) fn timeout_callback(&self, message: &str) -> TimeoutCallback {
        let events = self.clone();
        let message = message.to_owned();

        Arc::new(move || {
            let events = events.clone();
            let message = message.clone();
            async move {
                events.error_event(ClientEvent::Error {
                    message,
                    code: "timeout".to_owned(),
                    http_status: None,
                    is_context_window_error: None,
                });
            }
            .boxed()
        })
    }

    /// Finish a turn whose token fired, according to why it fired
    ///
    /// A superseded turn goes quiet because the newer turn owns the
    /// conversation. A timed-out turn already reported its error from the
    /// timer. Anything else is treated as the client going away.
    pub(crate) fn interrupted(&self, lifecycle: &RequestLifecycle) -> Interruption {
        let interruption = match lifecycle.state() {
            LifecycleState::Superseded => {
                self.silence();
                return Interruption::Superseded;
            }
            LifecycleState::TimedOut => Interruption::TimedOut,
            LifecycleState::Active | LifecycleState::Cancelled | LifecycleState::Ended => Interruption::Cancelled,
        };
        self.done(interruption.finish_reason());
        interruption
    }
}

/// Forwards streamed output to the client as it arrives
pub(crate) struct EventForwarder<'a> {
    events: &'a TurnEvents,
}

impl<'a> EventForwarder<'a> {
    pub(crate) const fn new(events: &'a TurnEvents) -> Self {
        Self { events }
    }
}

impl StreamCallbacks for EventForwarder<'_> {
    fn on_content(&mut self, text: &str) {
        self.events.emit(ClientEvent::chunk(text));
    }

    fn on_thinking(&mut self, text: &str) {
        self.events.emit(ClientEvent::Thinking {
            content: text.to_owned(),
        });
    }

    fn on_image(&mut self, image: &ImageFragment) {
        self.events.emit(ClientEvent::Image {
            mime_type: image.mime_type.clone(),
            data: image.data.clone(),
        });
    }

    fn on_grounding(&mut self, metadata: &Value) {
        self.events.emit(ClientEvent::Grounding {
            metadata: metadata.clone(),
        });
    }
}
