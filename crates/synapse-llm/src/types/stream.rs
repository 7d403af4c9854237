use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::response::{FinishReason, Usage};

/// Canonical record decoded from one upstream stream event
///
/// Every provider decoder produces this shape. Once a result with
/// `complete` or `error` set has been observed, the collector stops reading
/// the stream.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamResult {
    /// Text fragments in provider order
    pub content: Vec<String>,
    /// Partial tool calls to merge by index
    pub tool_calls: Vec<ToolCallFragment>,
    /// Reasoning text fragments
    pub thinking: Vec<String>,
    /// Inline images
    pub images: Vec<ImageFragment>,
    /// Search grounding attached to the response
    pub grounding_metadata: Option<Value>,
    pub finish_reason: Option<FinishReason>,
    pub usage: Option<Usage>,
    /// The provider signalled the end of the response
    pub complete: bool,
    /// The provider reported an error inside the stream
    pub error: bool,
    pub error_message: Option<String>,
    /// Provider error code, set when the provider itself reported the error
    pub error_code: Option<String>,
}

impl StreamResult {
    /// Terminal result with an optional finish reason
    pub fn done(finish_reason: Option<FinishReason>) -> Self {
        Self {
            finish_reason,
            complete: true,
            ..Self::default()
        }
    }

    /// In-stream failure
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            error: true,
            error_message: Some(message.into()),
            ..Self::default()
        }
    }

    /// Error event sent by the provider inside the stream
    pub fn provider_error(message: impl Into<String>, code: Option<String>) -> Self {
        Self {
            error_code: Some(code.unwrap_or_else(|| "upstream_error".to_owned())),
            ..Self::failure(message)
        }
    }

    pub fn text(fragment: impl Into<String>) -> Self {
        Self {
            content: vec![fragment.into()],
            ..Self::default()
        }
    }

    /// Whether this result carries nothing the collector would act on
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Partial tool call as it arrives on the wire
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolCallFragment {
    /// Merge key; fragments without one only update an existing call
    pub index: Option<u32>,
    pub id: Option<String>,
    pub tool_type: Option<String>,
    pub function: Option<FunctionFragment>,
    /// Raw argument text as sent by the provider, preferred over
    /// `function.arguments` when both exist
    pub raw_arguments: Option<String>,
    pub metadata: Map<String, Value>,
}

impl ToolCallFragment {
    /// Argument text this fragment contributes
    pub fn argument_text(&self) -> Option<&str> {
        self.raw_arguments
            .as_deref()
            .or_else(|| self.function.as_ref().and_then(|f| f.arguments.as_deref()))
    }

    pub fn name(&self) -> Option<&str> {
        self.function.as_ref().and_then(|f| f.name.as_deref())
    }
}

/// Partial function call within a fragment
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FunctionFragment {
    pub name: Option<String>,
    pub arguments: Option<String>,
}

/// Inline image produced by the model
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageFragment {
    pub mime_type: String,
    /// Base64-encoded payload
    pub data: String,
}
