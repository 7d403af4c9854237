use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Role of a message participant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System instruction
    System,
    /// User message
    User,
    /// Assistant response
    Assistant,
    /// Tool/function result
    Tool,
}

/// Message in a conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Role of the message author
    pub role: Role,
    /// Message content
    pub content: Content,
    /// Participant name; for tool messages, the name of the tool that ran
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Tool calls made by the assistant
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    /// ID of the tool call this message is a response to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Opaque reasoning signatures that must be echoed back to the provider
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thought_signatures: Option<Vec<String>>,
}

impl Message {
    fn new(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            content: Content::Text(text.into()),
            name: None,
            tool_calls: None,
            tool_call_id: None,
            thought_signatures: None,
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::new(Role::System, text)
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, text)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(Role::Assistant, text)
    }

    /// Assistant turn that requested tool calls
    ///
    /// Signatures are attached only when at least one is present.
    pub fn assistant_tool_calls(text: impl Into<String>, calls: Vec<ToolCall>, thought_signatures: Vec<String>) -> Self {
        Self {
            tool_calls: Some(calls),
            thought_signatures: (!thought_signatures.is_empty()).then_some(thought_signatures),
            ..Self::new(Role::Assistant, text)
        }
    }

    /// Result of a tool invocation
    pub fn tool(tool_call_id: impl Into<String>, tool_name: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            name: Some(tool_name.into()),
            tool_call_id: Some(tool_call_id.into()),
            ..Self::new(Role::Tool, output)
        }
    }
}

/// Message content, either plain text or structured parts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Content {
    /// Plain text content
    Text(String),
    /// Array of content parts (text, images, etc.)
    Parts(Vec<ContentPart>),
}

impl Content {
    /// Extract text content, joining parts if necessary
    pub fn as_text(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => Some(text.as_str()),
                    ContentPart::Image { .. } => None,
                })
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Self::Text(text) => text.is_empty(),
            Self::Parts(parts) => parts.is_empty(),
        }
    }
}

/// Individual part within a multipart message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    /// Text content block
    Text {
        /// The text string
        text: String,
    },
    /// Image reference
    Image {
        /// URL or base64 data URI for the image
        url: String,
        /// Detail level hint (e.g. "auto", "low", "high")
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
}

/// A tool call requested by the assistant
///
/// While a response is streaming the call is still being assembled by the
/// accumulator; once the stream completes it is frozen and recorded on the
/// assistant message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Provider-assigned position used to merge streamed fragments
    #[serde(default)]
    pub index: u32,
    /// Unique identifier for this tool call
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Tool type, normally "function"
    #[serde(rename = "type", default = "default_tool_type")]
    pub tool_type: String,
    /// Name of the function to call
    pub function: FunctionCall,
    /// Provider extras (e.g. `thought_signature`) echoed back verbatim
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl ToolCall {
    /// The provider thought signature carried in metadata, if any
    pub fn thought_signature(&self) -> Option<&str> {
        self.metadata.get(THOUGHT_SIGNATURE_KEY).and_then(Value::as_str)
    }
}

/// Metadata key under which provider thought signatures are stored
pub const THOUGHT_SIGNATURE_KEY: &str = "thought_signature";

pub(crate) fn default_tool_type() -> String {
    "function".to_owned()
}

/// Function name and arguments within a tool call
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionCall {
    /// Function name
    pub name: String,
    /// JSON-encoded arguments
    pub arguments: String,
}
