//! Canonical types for requests, messages, and decoded stream results
//!
//! These types are provider-agnostic; every wire format converts to and
//! from them at the adapter boundary.

pub mod message;
pub mod request;
pub mod response;
pub mod stream;
pub mod tool;

pub use message::{Content, ContentPart, FunctionCall, Message, Role, THOUGHT_SIGNATURE_KEY, ToolCall};
pub use request::{CompletionParams, CompletionRequest};
pub use response::{FinishReason, Usage};
pub use stream::{FunctionFragment, ImageFragment, StreamResult, ToolCallFragment};
pub use tool::{FunctionDefinition, ToolChoice, ToolChoiceMode, ToolDefinition, ToolSpec};
