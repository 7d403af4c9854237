//! Conversation core for Synapse
//!
//! Runs streamed chat turns against `OpenAI`, Anthropic and Google providers
//! behind one provider-neutral model. A turn either streams a single answer
//! ([`StreamingHandler`]) or runs an agentic tool loop ([`ToolExecutor`]).
//! Both publish [`ClientEvent`]s through an [`EventSink`] and guarantee one
//! terminal event per turn, with newer turns superseding older ones for the
//! same conversation.

#![allow(clippy::must_use_candidate, clippy::missing_errors_doc)]

pub mod accumulator;
pub mod collector;
pub mod convert;
pub mod error;
pub mod events;
pub mod executor;
pub mod lifecycle;
pub mod protocol;
pub mod provider;
pub mod state;
pub mod streaming;
pub mod tools;
pub mod turn;
pub mod types;

pub use accumulator::ToolCallAccumulator;
pub use collector::{CollectStatus, CollectedResponse, StreamCallbacks, StreamCollector};
pub use error::{LlmError, ProviderError};
pub use events::{ClientEvent, EventHub, EventSink};
pub use executor::{ToolExecutor, TurnOutcome, TurnState};
pub use lifecycle::{LifecycleRegistry, LifecycleState, RequestLifecycle};
pub use provider::{AdapterRegistry, PreparedRequest, ProviderAdapter, StreamDecoder};
pub use state::{ChatSettings, ChatState};
pub use streaming::{StreamOutcome, StreamState, StreamingHandler};
pub use tools::{Tool, ToolContext, ToolRegistry, ToolRunner};
pub use turn::TurnRequest;
pub use types::{CompletionRequest, FinishReason, Message, Role, ToolDefinition, ToolSpec, Usage};
