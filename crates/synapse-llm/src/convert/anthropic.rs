//! Conversion between canonical types and the Anthropic wire format

use crate::collector::RawEvent;
use crate::protocol::anthropic::{
    AnthropicContent, AnthropicContentBlock, AnthropicImageSource, AnthropicMessage, AnthropicRequest,
    AnthropicStreamContentBlock, AnthropicStreamDelta, AnthropicStreamEvent, AnthropicTool, AnthropicToolChoice,
};
use crate::provider::StreamDecoder;
use crate::types::{
    CompletionRequest, Content, ContentPart, FinishReason, FunctionFragment, Message, Role, StreamResult,
    ToolCallFragment, ToolChoice, ToolChoiceMode, Usage,
};

/// Default max tokens when not specified (Anthropic requires this field)
const DEFAULT_MAX_TOKENS: u32 = 4096;

// -- Outbound: canonical request -> Anthropic wire request --

impl From<&CompletionRequest> for AnthropicRequest {
    fn from(req: &CompletionRequest) -> Self {
        let mut system: Option<String> = None;
        let mut messages: Vec<AnthropicMessage> = Vec::new();

        for msg in &req.messages {
            if msg.role == Role::System {
                let text = msg.content.as_text();
                system = Some(match system {
                    Some(existing) => format!("{existing}\n\n{text}"),
                    None => text,
                });
                continue;
            }

            let converted = canonical_message_to_anthropic(msg);

            // Results of parallel tool calls must share one user turn
            if msg.role == Role::Tool
                && let Some(last) = messages.last_mut()
                && is_tool_result_turn(last)
                && let (AnthropicContent::Blocks(existing), AnthropicContent::Blocks(blocks)) =
                    (&mut last.content, converted.content.clone())
            {
                existing.extend(blocks);
                continue;
            }

            messages.push(converted);
        }

        let tools = req.tools.as_ref().filter(|t| !t.is_empty()).map(|tools| {
            tools
                .iter()
                .map(|t| AnthropicTool {
                    name: t.function.name.clone(),
                    description: t.function.description.clone(),
                    input_schema: t
                        .function
                        .parameters
                        .clone()
                        .unwrap_or_else(|| serde_json::json!({"type": "object"})),
                })
                .collect()
        });

        Self {
            model: req.model.clone(),
            max_tokens: req.params.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            system,
            messages,
            temperature: req.params.temperature,
            top_p: req.params.top_p,
            stop_sequences: req.params.stop.clone(),
            stream: true,
            tools,
            tool_choice: req.tool_choice.as_ref().map(tool_choice_to_anthropic),
        }
    }
}

fn is_tool_result_turn(msg: &AnthropicMessage) -> bool {
    msg.role == "user"
        && matches!(&msg.content, AnthropicContent::Blocks(blocks)
            if !blocks.is_empty() && blocks.iter().all(|b| matches!(b, AnthropicContentBlock::ToolResult { .. })))
}

fn canonical_message_to_anthropic(msg: &Message) -> AnthropicMessage {
    if msg.role == Role::Tool {
        return AnthropicMessage {
            role: "user".to_owned(),
            content: AnthropicContent::Blocks(vec![AnthropicContentBlock::ToolResult {
                tool_use_id: msg.tool_call_id.clone().unwrap_or_default(),
                content: Some(msg.content.as_text()),
            }]),
        };
    }

    let role = if msg.role == Role::Assistant { "assistant" } else { "user" };

    if let Some(tool_calls) = msg.tool_calls.as_ref().filter(|c| !c.is_empty()) {
        let mut blocks = Vec::with_capacity(tool_calls.len() + 1);

        let text = msg.content.as_text();
        if !text.is_empty() {
            blocks.push(AnthropicContentBlock::Text { text });
        }

        for tc in tool_calls {
            let input = serde_json::from_str(&tc.function.arguments).unwrap_or_else(|_| serde_json::json!({}));
            blocks.push(AnthropicContentBlock::ToolUse {
                id: tc.id.clone().unwrap_or_default(),
                name: tc.function.name.clone(),
                input,
            });
        }

        return AnthropicMessage {
            role: role.to_owned(),
            content: AnthropicContent::Blocks(blocks),
        };
    }

    let content = match &msg.content {
        Content::Text(text) => AnthropicContent::Text(text.clone()),
        Content::Parts(parts) => AnthropicContent::Blocks(parts.iter().map(content_part_to_block).collect()),
    };

    AnthropicMessage {
        role: role.to_owned(),
        content,
    }
}

fn content_part_to_block(part: &ContentPart) -> AnthropicContentBlock {
    match part {
        ContentPart::Text { text } => AnthropicContentBlock::Text { text: text.clone() },
        ContentPart::Image { url, .. } => {
            let source = match url.strip_prefix("data:").and_then(|rest| rest.split_once(',')) {
                Some((mime_and_encoding, data)) => AnthropicImageSource {
                    source_type: "base64".to_owned(),
                    media_type: Some(
                        mime_and_encoding
                            .strip_suffix(";base64")
                            .unwrap_or(mime_and_encoding)
                            .to_owned(),
                    ),
                    data: Some(data.to_owned()),
                    url: None,
                },
                None => AnthropicImageSource {
                    source_type: "url".to_owned(),
                    media_type: None,
                    data: None,
                    url: Some(url.clone()),
                },
            };
            AnthropicContentBlock::Image { source }
        }
    }
}

fn tool_choice_to_anthropic(choice: &ToolChoice) -> AnthropicToolChoice {
    let (choice_type, name) = match choice {
        ToolChoice::Mode(ToolChoiceMode::None) => ("none", None),
        ToolChoice::Mode(ToolChoiceMode::Auto) => ("auto", None),
        ToolChoice::Mode(ToolChoiceMode::Required) => ("any", None),
        ToolChoice::Function { name } => ("tool", Some(name.clone())),
    };

    AnthropicToolChoice {
        choice_type: choice_type.to_owned(),
        name,
    }
}

// -- Inbound: stream events -> canonical results --

/// Stateful decoder for Anthropic message streams
///
/// Content block indices are shared by text, thinking and tool-use blocks,
/// so tool calls get their own sequential index. Input JSON deltas are
/// attributed to the tool block currently open.
#[derive(Debug, Default)]
pub struct AnthropicStreamState {
    /// Input token count reported by `message_start`
    input_tokens: u32,
    /// Tool-call index of the open `tool_use` block
    current_tool_index: Option<u32>,
    next_tool_index: u32,
}

impl AnthropicStreamState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Convert one parsed stream event
    pub fn convert_event(&mut self, event: AnthropicStreamEvent) -> StreamResult {
        match event {
            AnthropicStreamEvent::MessageStart { message } => {
                self.input_tokens = message.usage.map_or(0, |u| u.input_tokens);
                StreamResult::default()
            }

            AnthropicStreamEvent::ContentBlockStart { content_block, .. } => match content_block {
                AnthropicStreamContentBlock::Text { text } => text_result(text),
                AnthropicStreamContentBlock::Thinking { thinking } => thinking_result(thinking),
                AnthropicStreamContentBlock::ToolUse { id, name, input } => {
                    let index = self.next_tool_index;
                    self.next_tool_index += 1;
                    self.current_tool_index = Some(index);

                    let arguments = if input.is_null() {
                        "{}".to_owned()
                    } else {
                        input.to_string()
                    };

                    StreamResult {
                        tool_calls: vec![ToolCallFragment {
                            index: Some(index),
                            id: Some(id),
                            tool_type: Some("function".to_owned()),
                            function: Some(FunctionFragment {
                                name: Some(name),
                                arguments: Some(arguments),
                            }),
                            ..ToolCallFragment::default()
                        }],
                        ..StreamResult::default()
                    }
                }
                AnthropicStreamContentBlock::Unknown => StreamResult::default(),
            },

            AnthropicStreamEvent::ContentBlockDelta { delta, .. } => match delta {
                AnthropicStreamDelta::TextDelta { text } => text_result(text),
                AnthropicStreamDelta::ThinkingDelta { thinking } => thinking_result(thinking),
                AnthropicStreamDelta::InputJsonDelta { partial_json } => match self.current_tool_index {
                    Some(index) if !partial_json.is_empty() => StreamResult {
                        tool_calls: vec![ToolCallFragment {
                            index: Some(index),
                            raw_arguments: Some(partial_json),
                            ..ToolCallFragment::default()
                        }],
                        ..StreamResult::default()
                    },
                    _ => StreamResult::default(),
                },
                AnthropicStreamDelta::SignatureDelta { .. } | AnthropicStreamDelta::Unknown => StreamResult::default(),
            },

            AnthropicStreamEvent::ContentBlockStop { .. } => {
                self.current_tool_index = None;
                StreamResult::default()
            }

            AnthropicStreamEvent::MessageDelta { delta, usage } => StreamResult {
                finish_reason: delta.stop_reason.as_deref().map(FinishReason::from_provider),
                usage: usage.map(|u| Usage::new(self.input_tokens, u.output_tokens)),
                ..StreamResult::default()
            },

            AnthropicStreamEvent::MessageStop => StreamResult::done(None),

            AnthropicStreamEvent::Ping => StreamResult::default(),

            AnthropicStreamEvent::Error { error } => StreamResult::provider_error(error.message, Some(error.error_type)),
        }
    }
}

impl StreamDecoder for AnthropicStreamState {
    fn decode(&mut self, event: &RawEvent, provider: &str) -> StreamResult {
        let data = event.data.trim();
        if data.is_empty() {
            return StreamResult::default();
        }

        match serde_json::from_str::<AnthropicStreamEvent>(data) {
            Ok(parsed) => self.convert_event(parsed),
            Err(e) => {
                // Event types added after this decoder was written are skipped
                if event.event.as_deref().is_some_and(|name| !is_known_event(name)) {
                    tracing::debug!(provider = %provider, event = ?event.event, "skipping unknown stream event");
                    return StreamResult::default();
                }
                tracing::debug!(provider = %provider, error = %e, data = %data, "unparseable stream event");
                StreamResult::failure(format!("malformed stream event from {provider}: {e}"))
            }
        }
    }
}

fn is_known_event(name: &str) -> bool {
    matches!(
        name,
        "message_start"
            | "content_block_start"
            | "content_block_delta"
            | "content_block_stop"
            | "message_delta"
            | "message_stop"
            | "ping"
            | "error"
    )
}

fn text_result(text: String) -> StreamResult {
    if text.is_empty() {
        StreamResult::default()
    } else {
        StreamResult::text(text)
    }
}

fn thinking_result(thinking: String) -> StreamResult {
    if thinking.is_empty() {
        StreamResult::default()
    } else {
        StreamResult {
            thinking: vec![thinking],
            ..StreamResult::default()
        }
    }
}
