//! Client-visible conversation events
//!
//! Everything a client sees about a turn is published as a [`ClientEvent`]
//! through an [`EventSink`], keyed by conversation id. [`EventHub`] fans
//! events out to any number of subscribers per conversation.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

use crate::error::LlmError;
use crate::types::FinishReason;

/// Event published to the client of a conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientEvent {
    /// The turn started or moved to a new phase
    Processing {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    /// Answer text
    Chunk { content: String },
    /// Model reasoning text
    Thinking { content: String },
    /// Inline image produced by the model
    Image { mime_type: String, data: String },
    /// Search grounding attached to the answer
    Grounding { metadata: Value },
    ToolCallStart { tool_name: String, input: Value },
    ToolCallEnd {
        tool_name: String,
        output: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// A passthrough tool answered the user directly
    ToolStreamComplete { tool_name: String, content: String },
    Error {
        message: String,
        code: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        http_status: Option<u16>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        is_context_window_error: Option<bool>,
    },
    /// Terminal event of a turn
    Done { finish_reason: FinishReason },
}

impl ClientEvent {
    pub fn processing(message: impl Into<String>) -> Self {
        Self::Processing {
            message: Some(message.into()),
        }
    }

    pub fn chunk(content: impl Into<String>) -> Self {
        Self::Chunk {
            content: content.into(),
        }
    }

    pub const fn done(finish_reason: FinishReason) -> Self {
        Self::Done { finish_reason }
    }

    /// Error event describing `error`
    pub fn from_error(error: &LlmError) -> Self {
        Self::Error {
            message: error.client_message(),
            code: error.code().to_owned(),
            http_status: error.http_status(),
            is_context_window_error: error.is_context_window_error().then_some(true),
        }
    }

    /// Whether this event ends a turn
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. })
    }
}

/// Destination for client events
pub trait EventSink: Send + Sync {
    fn publish(&self, conversation_id: &str, event: ClientEvent);
}

/// Default per-conversation channel capacity
pub const DEFAULT_EVENT_BUFFER: usize = 256;

/// In-process event fan-out with one broadcast channel per conversation
///
/// Events published while nobody is subscribed are dropped, and a channel
/// whose last subscriber has gone is removed on the next publish. Slow
/// subscribers lose the oldest events once `capacity` is exceeded.
pub struct EventHub {
    channels: DashMap<String, broadcast::Sender<ClientEvent>>,
    capacity: usize,
}

impl EventHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Receive events for a conversation from now on
    pub fn subscribe(&self, conversation_id: &str) -> broadcast::Receiver<ClientEvent> {
        self.channels
            .entry(conversation_id.to_owned())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Drop the channel for a conversation; subscribers see the stream close
    pub fn close(&self, conversation_id: &str) {
        self.channels.remove(conversation_id);
    }

    pub fn subscriber_count(&self, conversation_id: &str) -> usize {
        self.channels
            .get(conversation_id)
            .map_or(0, |sender| sender.receiver_count())
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_BUFFER)
    }
}

impl EventSink for EventHub {
    fn publish(&self, conversation_id: &str, event: ClientEvent) {
        let delivered = {
            let Some(sender) = self.channels.get(conversation_id) else {
                tracing::trace!(conversation_id, "no subscribers for event");
                return;
            };
            sender.send(event).is_ok()
        };

        // the read guard must be released before removing from the same shard
        if !delivered {
            self.channels
                .remove_if(conversation_id, |_, sender| sender.receiver_count() == 0);
            tracing::trace!(conversation_id, "all subscribers gone, channel removed");
        }
    }
}
