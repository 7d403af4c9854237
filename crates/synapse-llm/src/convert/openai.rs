//! Conversion between canonical types and the `OpenAI` wire format

use crate::collector::RawEvent;
use crate::protocol::openai::{
    OpenAiContent, OpenAiContentPart, OpenAiFunction, OpenAiFunctionCall, OpenAiImageUrl, OpenAiMessage,
    OpenAiRequest, OpenAiStreamChunk, OpenAiTool, OpenAiToolCall,
};
use crate::provider::StreamDecoder;
use crate::types::{
    CompletionRequest, Content, ContentPart, FinishReason, FunctionFragment, Message, Role, StreamResult,
    ToolCallFragment, ToolChoice, ToolChoiceMode, Usage,
};

// -- Outbound: canonical request -> OpenAI wire request --

impl From<&CompletionRequest> for OpenAiRequest {
    fn from(req: &CompletionRequest) -> Self {
        Self {
            model: req.model.clone(),
            messages: req.messages.iter().map(Into::into).collect(),
            temperature: req.params.temperature,
            top_p: req.params.top_p,
            max_tokens: req.params.max_tokens,
            stop: req.params.stop.clone(),
            stream: true,
            tools: req.tools.as_ref().filter(|t| !t.is_empty()).map(|tools| {
                tools
                    .iter()
                    .map(|t| OpenAiTool {
                        tool_type: t.tool_type.clone(),
                        function: OpenAiFunction {
                            name: t.function.name.clone(),
                            description: t.function.description.clone(),
                            parameters: t.function.parameters.clone(),
                        },
                    })
                    .collect()
            }),
            tool_choice: req.tool_choice.as_ref().map(tool_choice_to_openai_value),
            stream_options: None,
        }
    }
}

impl From<&Message> for OpenAiMessage {
    fn from(msg: &Message) -> Self {
        let role = match msg.role {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        };

        let tool_calls = msg.tool_calls.as_ref().filter(|c| !c.is_empty()).map(|calls| {
            calls
                .iter()
                .map(|tc| OpenAiToolCall {
                    id: tc.id.clone().unwrap_or_default(),
                    tool_type: tc.tool_type.clone(),
                    function: OpenAiFunctionCall {
                        name: tc.function.name.clone(),
                        arguments: tc.function.arguments.clone(),
                    },
                })
                .collect()
        });

        // An assistant turn that only calls tools carries null content
        let content = match &msg.content {
            Content::Text(text) if text.is_empty() && tool_calls.is_some() => None,
            Content::Text(text) => Some(OpenAiContent::Text(text.clone())),
            Content::Parts(parts) => Some(OpenAiContent::Parts(parts.iter().map(Into::into).collect())),
        };

        Self {
            role: role.to_owned(),
            content,
            name: msg.name.clone().filter(|_| msg.role != Role::Tool),
            tool_calls,
            tool_call_id: msg.tool_call_id.clone(),
        }
    }
}

impl From<&ContentPart> for OpenAiContentPart {
    fn from(part: &ContentPart) -> Self {
        match part {
            ContentPart::Text { text } => Self::Text { text: text.clone() },
            ContentPart::Image { url, detail } => Self::ImageUrl {
                image_url: OpenAiImageUrl {
                    url: url.clone(),
                    detail: detail.clone(),
                },
            },
        }
    }
}

/// Convert a canonical tool choice to the `OpenAI` JSON value
fn tool_choice_to_openai_value(choice: &ToolChoice) -> serde_json::Value {
    match choice {
        ToolChoice::Mode(mode) => {
            let s = match mode {
                ToolChoiceMode::None => "none",
                ToolChoiceMode::Auto => "auto",
                ToolChoiceMode::Required => "required",
            };
            serde_json::Value::String(s.to_owned())
        }
        ToolChoice::Function { name } => serde_json::json!({
            "type": "function",
            "function": { "name": name }
        }),
    }
}

// -- Inbound: stream chunks -> canonical results --

/// Decoder for `chat.completion.chunk` streams
///
/// The stream is complete on `[DONE]`; the finish reason arrives earlier on
/// the last content chunk and usage (if requested) on a chunk of its own.
#[derive(Debug, Default)]
pub struct OpenAiDecoder;

impl StreamDecoder for OpenAiDecoder {
    fn decode(&mut self, event: &RawEvent, provider: &str) -> StreamResult {
        let data = event.data.trim();

        if data.is_empty() {
            return StreamResult::default();
        }
        if data == "[DONE]" {
            return StreamResult::done(None);
        }

        let chunk = match serde_json::from_str::<OpenAiStreamChunk>(data) {
            Ok(chunk) => chunk,
            Err(e) => {
                tracing::debug!(provider = %provider, error = %e, data = %data, "unparseable stream chunk");
                return StreamResult::failure(format!("malformed stream chunk from {provider}: {e}"));
            }
        };

        openai_chunk_to_result(chunk)
    }
}

/// Convert one `OpenAI` stream chunk
pub fn openai_chunk_to_result(chunk: OpenAiStreamChunk) -> StreamResult {
    if let Some(error) = chunk.error {
        let code = error.code_str();
        return StreamResult::provider_error(error.message, code);
    }

    let mut result = StreamResult::default();

    for choice in chunk.choices {
        let delta = choice.delta;

        if let Some(text) = delta.content.filter(|t| !t.is_empty()) {
            result.content.push(text);
        }

        if let Some(reasoning) = delta.reasoning_content.filter(|t| !t.is_empty()) {
            result.thinking.push(reasoning);
        }

        for call in delta.tool_calls.into_iter().flatten() {
            result.tool_calls.push(ToolCallFragment {
                index: call.index,
                id: call.id,
                tool_type: call.tool_type,
                function: call.function.map(|f| FunctionFragment {
                    name: f.name,
                    arguments: f.arguments,
                }),
                ..ToolCallFragment::default()
            });
        }

        if let Some(reason) = choice.finish_reason.as_deref() {
            result.finish_reason = Some(FinishReason::from_provider(reason));
        }
    }

    if let Some(usage) = chunk.usage {
        result.usage = Some(Usage {
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            total_tokens: usage.total_tokens,
        });
    }

    result
}
