//! Conversion between canonical types and the Google Generative Language wire format

use serde_json::{Map, Value};

use crate::collector::RawEvent;
use crate::protocol::google::{
    GoogleContent, GoogleFunctionCall, GoogleFunctionCallingConfig, GoogleFunctionDeclaration, GoogleFunctionResponse,
    GoogleGenerationConfig, GoogleInlineData, GooglePart, GoogleRequest, GoogleStreamChunk, GoogleTool,
    GoogleToolConfig,
};
use crate::provider::StreamDecoder;
use crate::types::{
    CompletionRequest, Content, ContentPart, FinishReason, FunctionFragment, ImageFragment, Message, Role,
    StreamResult, THOUGHT_SIGNATURE_KEY, ToolCallFragment, ToolChoice, ToolChoiceMode, Usage,
};

// -- Outbound: canonical request -> Google wire request --

impl From<&CompletionRequest> for GoogleRequest {
    fn from(req: &CompletionRequest) -> Self {
        let mut system_parts: Vec<GooglePart> = Vec::new();
        let mut contents: Vec<GoogleContent> = Vec::new();

        for msg in &req.messages {
            match msg.role {
                Role::System => system_parts.push(GooglePart::text(msg.content.as_text())),
                Role::User => contents.push(canonical_message_to_google(msg, "user")),
                Role::Assistant => contents.push(canonical_message_to_google(msg, "model")),
                Role::Tool => {
                    let part = function_response_part(msg);

                    // Responses to parallel calls travel in a single turn
                    match contents.last_mut() {
                        Some(last) if is_function_response_turn(last) => last.parts.push(part),
                        _ => contents.push(GoogleContent {
                            role: Some("user".to_owned()),
                            parts: vec![part],
                        }),
                    }
                }
            }
        }

        let params = &req.params;
        let generation_config = (params.temperature.is_some()
            || params.top_p.is_some()
            || params.max_tokens.is_some()
            || params.stop.is_some())
        .then(|| GoogleGenerationConfig {
            temperature: params.temperature,
            top_p: params.top_p,
            max_output_tokens: params.max_tokens,
            stop_sequences: params.stop.clone(),
        });

        let tools = req.tools.as_ref().filter(|t| !t.is_empty()).map(|tools| {
            vec![GoogleTool {
                function_declarations: tools
                    .iter()
                    .map(|t| GoogleFunctionDeclaration {
                        name: t.function.name.clone(),
                        description: t.function.description.clone(),
                        parameters: t.function.parameters.clone(),
                    })
                    .collect(),
            }]
        });

        let tool_config = req.tool_choice.as_ref().map(|choice| {
            let (mode, allowed_function_names) = match choice {
                ToolChoice::Mode(ToolChoiceMode::None) => ("NONE", None),
                ToolChoice::Mode(ToolChoiceMode::Auto) => ("AUTO", None),
                ToolChoice::Mode(ToolChoiceMode::Required) => ("ANY", None),
                ToolChoice::Function { name } => ("ANY", Some(vec![name.clone()])),
            };
            GoogleToolConfig {
                function_calling_config: GoogleFunctionCallingConfig {
                    mode: mode.to_owned(),
                    allowed_function_names,
                },
            }
        });

        Self {
            contents,
            system_instruction: (!system_parts.is_empty()).then(|| GoogleContent {
                role: None,
                parts: system_parts,
            }),
            generation_config,
            tools,
            tool_config,
        }
    }
}

fn canonical_message_to_google(msg: &Message, role: &str) -> GoogleContent {
    let mut parts = Vec::new();

    match &msg.content {
        Content::Text(text) if !text.is_empty() => parts.push(GooglePart::text(text.clone())),
        Content::Text(_) => {}
        Content::Parts(content_parts) => {
            for part in content_parts {
                match part {
                    ContentPart::Text { text } => parts.push(GooglePart::text(text.clone())),
                    ContentPart::Image { url, .. } => {
                        // Only inline data URIs are accepted here
                        if let Some((mime_and_encoding, data)) =
                            url.strip_prefix("data:").and_then(|rest| rest.split_once(','))
                        {
                            parts.push(GooglePart {
                                inline_data: Some(GoogleInlineData {
                                    mime_type: mime_and_encoding
                                        .strip_suffix(";base64")
                                        .unwrap_or(mime_and_encoding)
                                        .to_owned(),
                                    data: data.to_owned(),
                                }),
                                ..GooglePart::default()
                            });
                        }
                    }
                }
            }
        }
    }

    let signatures = msg.thought_signatures.as_deref().unwrap_or_default();

    for (i, tc) in msg.tool_calls.iter().flatten().enumerate() {
        let args = serde_json::from_str(&tc.function.arguments).unwrap_or_else(|_| serde_json::json!({}));
        let thought_signature = tc
            .thought_signature()
            .map(str::to_owned)
            .or_else(|| signatures.get(i).cloned());

        parts.push(GooglePart {
            function_call: Some(GoogleFunctionCall {
                name: tc.function.name.clone(),
                args,
            }),
            thought_signature,
            ..GooglePart::default()
        });
    }

    if parts.is_empty() {
        parts.push(GooglePart::text(String::new()));
    }

    GoogleContent {
        role: Some(role.to_owned()),
        parts,
    }
}

/// Tool output as a `functionResponse`; non-object outputs are wrapped
fn function_response_part(msg: &Message) -> GooglePart {
    let text = msg.content.as_text();
    let response = match serde_json::from_str::<Value>(&text) {
        Ok(value @ Value::Object(_)) => value,
        Ok(other) => serde_json::json!({ "content": other }),
        Err(_) => serde_json::json!({ "content": text }),
    };

    GooglePart {
        function_response: Some(GoogleFunctionResponse {
            name: msg.name.clone().unwrap_or_default(),
            response,
        }),
        ..GooglePart::default()
    }
}

fn is_function_response_turn(content: &GoogleContent) -> bool {
    content.role.as_deref() == Some("user")
        && !content.parts.is_empty()
        && content.parts.iter().all(|p| p.function_response.is_some())
}

// -- Inbound: stream chunks -> canonical results --

/// Decoder for `streamGenerateContent` responses
///
/// Function calls arrive whole, one per part, and are numbered in arrival
/// order. A finish reason ends the stream; if any function call was seen
/// during the response it is reported as a tool-call finish regardless of
/// the reason Google gives.
#[derive(Debug, Default)]
pub struct GoogleDecoder {
    next_tool_index: u32,
    saw_function_call: bool,
}

impl GoogleDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn convert_chunk(&mut self, chunk: GoogleStreamChunk) -> StreamResult {
        if let Some(error) = chunk.error {
            let code = error.status.or_else(|| error.code.map(|c| c.to_string()));
            return StreamResult::provider_error(error.message, code);
        }

        let mut result = StreamResult::default();
        let mut finish_reason = None;

        for candidate in chunk.candidates {
            for part in candidate.content.map(|c| c.parts).unwrap_or_default() {
                self.convert_part(part, &mut result);
            }

            if let Some(grounding) = candidate.grounding_metadata {
                result.grounding_metadata = Some(grounding);
            }

            if let Some(reason) = candidate.finish_reason {
                finish_reason = Some(reason);
            }
        }

        if let Some(usage) = chunk.usage_metadata {
            result.usage = Some(Usage {
                prompt_tokens: usage.prompt_token_count,
                completion_tokens: usage.candidates_token_count,
                total_tokens: usage.total_token_count,
            });
        }

        if let Some(reason) = finish_reason {
            result.complete = true;
            result.finish_reason = Some(if self.saw_function_call {
                FinishReason::ToolCalls
            } else {
                FinishReason::from_provider(&reason)
            });
        }

        result
    }

    fn convert_part(&mut self, part: GooglePart, result: &mut StreamResult) {
        if let Some(text) = part.text.filter(|t| !t.is_empty()) {
            if part.thought == Some(true) {
                result.thinking.push(text);
            } else {
                result.content.push(text);
            }
        }

        if let Some(inline) = part.inline_data {
            result.images.push(ImageFragment {
                mime_type: inline.mime_type,
                data: inline.data,
            });
        }

        if let Some(call) = part.function_call {
            let index = self.next_tool_index;
            self.next_tool_index += 1;
            self.saw_function_call = true;

            let arguments = if call.args.is_null() {
                "{}".to_owned()
            } else {
                call.args.to_string()
            };

            let mut metadata = Map::new();
            if let Some(signature) = part.thought_signature {
                metadata.insert(THOUGHT_SIGNATURE_KEY.to_owned(), Value::String(signature));
            }

            result.tool_calls.push(ToolCallFragment {
                index: Some(index),
                tool_type: Some("function".to_owned()),
                function: Some(FunctionFragment {
                    name: Some(call.name),
                    arguments: Some(arguments),
                }),
                metadata,
                ..ToolCallFragment::default()
            });
        }
    }
}

impl StreamDecoder for GoogleDecoder {
    fn decode(&mut self, event: &RawEvent, provider: &str) -> StreamResult {
        let data = event.data.trim();
        if data.is_empty() {
            return StreamResult::default();
        }

        match serde_json::from_str::<GoogleStreamChunk>(data) {
            Ok(chunk) => self.convert_chunk(chunk),
            Err(e) => {
                tracing::debug!(provider = %provider, error = %e, data = %data, "unparseable stream chunk");
                StreamResult::failure(format!("malformed stream chunk from {provider}: {e}"))
            }
        }
    }
}
