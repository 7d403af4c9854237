//! Agentic tool loop
//!
//! Each round streams one model response. When the model asks for tools the
//! calls are executed, their results appended to the conversation, and the
//! model is asked again until it answers, a passthrough tool answers for it,
//! or the round limit is reached.
//!
//! Thinking, images and grounding are forwarded live. The answer text is
//! published once, as a single chunk, when the turn finishes. Only the last
//! round's text is the answer; text from rounds that requested tools stays
//! in the assistant message it belongs to.

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::{Value, json};
use uuid::Uuid;

use crate::collector::{CollectStatus, StreamCollector};
use crate::error::LlmError;
use crate::events::ClientEvent;
use crate::lifecycle::RequestLifecycle;
use crate::state::ChatState;
use crate::tools::{ToolContext, ToolRunner, parse_arguments};
use crate::turn::{EventForwarder, Interruption, TurnEvents, TurnRequest};
use crate::types::{CompletionRequest, FinishReason, Message, ToolCall, ToolSpec, Usage};

/// Terminal state of a tool loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    /// The model answered without requesting tools
    Final,
    /// A passthrough tool answered the user
    WaitingForUser,
    /// The round limit was reached
    MaxIterations,
    Failed,
    Cancelled,
    Superseded,
    TimedOut,
}

impl From<Interruption> for TurnState {
    fn from(value: Interruption) -> Self {
        match value {
            Interruption::Superseded => Self::Superseded,
            Interruption::TimedOut => Self::TimedOut,
            Interruption::Cancelled => Self::Cancelled,
        }
    }
}

/// Result of a tool loop
#[derive(Debug)]
pub struct TurnOutcome {
    pub state: TurnState,
    /// Answer text; for a passthrough tool, the tool's output
    pub content: String,
    pub finish_reason: FinishReason,
    /// Conversation including every assistant and tool message of the turn
    pub messages: Vec<Message>,
    /// Model rounds issued
    pub iterations: u32,
    /// Token usage summed over all rounds
    pub usage: Option<Usage>,
}

/// How the loop ended when it did not fail
enum Ending {
    Final(FinishReason),
    WaitingForUser(String),
    MaxIterations,
}

/// Mutable state carried across rounds
struct Progress {
    request: CompletionRequest,
    /// Text of the latest round
    content: String,
    usage: Option<Usage>,
    iterations: u32,
}

/// Runs tool-enabled turns
#[derive(Clone)]
pub struct ToolExecutor {
    state: ChatState,
    runner: Arc<dyn ToolRunner>,
}

impl ToolExecutor {
    pub fn new(state: ChatState, runner: Arc<dyn ToolRunner>) -> Self {
        Self { state, runner }
    }

    /// Run the loop for one turn with the given tools enabled
    ///
    /// Failures are reported to the client and reflected in the outcome
    /// rather than returned.
    pub async fn run(&self, turn: TurnRequest, tools: &[ToolSpec]) -> TurnOutcome {
        let events = TurnEvents::new(&turn.conversation_id, Arc::clone(self.state.sink()));
        let settings = self.state.settings();

        let lifecycle = self.state.lifecycles().begin(
            &turn.conversation_id,
            settings.request_timeout,
            Some(events.timeout_callback(&settings.timeout_message)),
        );

        let mut request = turn.request.clone();
        if !tools.is_empty() {
            request.tools = Some(tools.iter().map(|t| t.definition.clone()).collect());
        }
        let passthrough: HashSet<&str> = tools
            .iter()
            .filter(|t| t.passthrough)
            .map(|t| t.definition.name())
            .collect();

        let mut progress = Progress {
            request,
            content: String::new(),
            usage: None,
            iterations: 0,
        };

        tracing::debug!(
            conversation_id = %turn.conversation_id,
            provider = %turn.provider,
            model = %turn.request.model,
            tools = tools.len(),
            "tool loop started"
        );
        events.emit(ClientEvent::Processing { message: None });

        let result = self
            .drive(&turn, &passthrough, &lifecycle, &events, &mut progress)
            .await;
        self.state.lifecycles().end(&lifecycle);

        let outcome = settle(result, progress, &lifecycle, &events);
        tracing::debug!(
            conversation_id = %turn.conversation_id,
            state = ?outcome.state,
            iterations = outcome.iterations,
            finish_reason = %outcome.finish_reason,
            "tool loop finished"
        );
        outcome
    }

    async fn drive(
        &self,
        turn: &TurnRequest,
        passthrough: &HashSet<&str>,
        lifecycle: &RequestLifecycle,
        events: &TurnEvents,
        progress: &mut Progress,
    ) -> Result<Ending, LlmError> {
        let adapter = self.state.adapters().get(&turn.provider)?;
        let max_iterations = self.state.settings().max_iterations;

        loop {
            if progress.iterations >= max_iterations {
                tracing::warn!(
                    conversation_id = %turn.conversation_id,
                    max_iterations,
                    "tool loop hit the round limit"
                );
                return Ok(Ending::MaxIterations);
            }
            if progress.iterations > 0 {
                self.state.lifecycles().reset_timeout(lifecycle);
            }
            if lifecycle.token().is_cancelled() {
                return Err(LlmError::Cancelled);
            }
            progress.iterations += 1;

            let response = self
                .state
                .open_stream(adapter.as_ref(), &progress.request, lifecycle.token())
                .await?;
            let collector = StreamCollector::new(Arc::clone(&adapter), lifecycle.token().clone());
            let collected = collector
                .collect(response, Some(&mut EventForwarder::new(events)))
                .await?;

            if let Some(usage) = collected.usage {
                *progress.usage.get_or_insert_default() += usage;
            }
            progress.content.clone_from(&collected.content);

            let finish_reason = match collected.status {
                CollectStatus::Cancelled => return Err(LlmError::Cancelled),
                CollectStatus::Completed => collected.finish_reason.unwrap_or(FinishReason::Stop),
                CollectStatus::EndOfStream => FinishReason::ConnectionClosed,
            };

            let calls: Vec<ToolCall> = collected
                .tool_calls
                .into_iter()
                .filter(|call| {
                    let named = !call.function.name.is_empty();
                    if !named {
                        tracing::debug!(index = call.index, "dropping tool call without a name");
                    }
                    named
                })
                .map(prepare_call)
                .collect();

            if finish_reason != FinishReason::ToolCalls || calls.is_empty() {
                return Ok(Ending::Final(finish_reason));
            }

            let names: Vec<&str> = calls.iter().map(|c| c.function.name.as_str()).collect();
            events.emit(ClientEvent::processing(format!("using tool(s): {}", names.join(", "))));

            progress.request.messages.push(Message::assistant_tool_calls(
                collected.content,
                calls.clone(),
                collected.thought_signatures,
            ));

            for call in &calls {
                if let Some(answer) = self
                    .dispatch(turn, call, passthrough, lifecycle, events, progress)
                    .await?
                {
                    return Ok(Ending::WaitingForUser(answer));
                }
            }
        }
    }

    /// Execute one tool call and record its result
    ///
    /// Returns the answer text when a passthrough tool ends the turn.
    async fn dispatch(
        &self,
        turn: &TurnRequest,
        call: &ToolCall,
        passthrough: &HashSet<&str>,
        lifecycle: &RequestLifecycle,
        events: &TurnEvents,
        progress: &mut Progress,
    ) -> Result<Option<String>, LlmError> {
        let name = call.function.name.as_str();
        let call_id = call.id.clone().unwrap_or_default();
        let arguments = parse_arguments(name, &call.function.arguments);

        events.emit(ClientEvent::ToolCallStart {
            tool_name: name.to_owned(),
            input: arguments.clone(),
        });

        let context = ToolContext {
            conversation_id: events.conversation_id().to_owned(),
            user_id: turn.user_id.clone(),
            tool_call_id: call_id.clone(),
            sink: Arc::clone(events.sink()),
        };
        let result = self.runner.run(name, arguments, &context).await;

        // the tool itself is never aborted, but its result is dropped
        if lifecycle.token().is_cancelled() {
            return Err(LlmError::Cancelled);
        }

        match (result, passthrough.contains(name)) {
            (Ok(output), true) => {
                let answer = output_text(&output);
                events.emit(ClientEvent::ToolCallEnd {
                    tool_name: name.to_owned(),
                    output,
                    error: None,
                });
                progress.request.messages.push(Message::assistant(answer.clone()));
                events.emit(ClientEvent::ToolStreamComplete {
                    tool_name: name.to_owned(),
                    content: answer.clone(),
                });
                Ok(Some(answer))
            }
            (Ok(output), false) => {
                progress
                    .request
                    .messages
                    .push(Message::tool(call_id, name, output_text(&output)));
                events.emit(ClientEvent::ToolCallEnd {
                    tool_name: name.to_owned(),
                    output,
                    error: None,
                });
                Ok(None)
            }
            (Err(e), is_passthrough) => {
                let message = format!("{e:#}");
                tracing::warn!(tool = %name, call_id = %call_id, error = %message, "tool failed");

                events.emit(ClientEvent::ToolCallEnd {
                    tool_name: name.to_owned(),
                    output: Value::Null,
                    error: Some(message.clone()),
                });

                if is_passthrough {
                    return Err(LlmError::ToolFailed {
                        tool: name.to_owned(),
                        message,
                    });
                }

                let error = json!({"error": message, "tool": name});
                progress
                    .request
                    .messages
                    .push(Message::tool(call_id, name, error.to_string()));
                Ok(None)
            }
        }
    }
}

/// Give the call an id and non-empty arguments before it is recorded
fn prepare_call(mut call: ToolCall) -> ToolCall {
    if call.id.as_deref().is_none_or(str::is_empty) {
        call.id = Some(format!("call_{}", Uuid::new_v4().simple()));
    }
    if call.function.arguments.trim().is_empty() {
        call.function.arguments = "{}".to_owned();
    }
    call
}

/// Text form of a tool result as fed back to the model
fn output_text(output: &Value) -> String {
    match output {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn settle(
    result: Result<Ending, LlmError>,
    progress: Progress,
    lifecycle: &RequestLifecycle,
    events: &TurnEvents,
) -> TurnOutcome {
    let Progress {
        request,
        content,
        usage,
        iterations,
    } = progress;

    let (state, content, finish_reason) = match result {
        Ok(Ending::Final(finish_reason)) => {
            publish_answer(events, &content, finish_reason);
            (TurnState::Final, content, finish_reason)
        }
        Ok(Ending::MaxIterations) => {
            publish_answer(events, &content, FinishReason::MaxIterations);
            (TurnState::MaxIterations, content, FinishReason::MaxIterations)
        }
        Ok(Ending::WaitingForUser(answer)) => {
            events.done(FinishReason::Stop);
            (TurnState::WaitingForUser, answer, FinishReason::Stop)
        }
        Err(LlmError::Cancelled) => interrupted(lifecycle, events, content),
        // transport errors caused by an abort are not failures
        Err(_) if lifecycle.token().is_cancelled() => interrupted(lifecycle, events, content),
        Err(error) => {
            tracing::warn!(
                conversation_id = %events.conversation_id(),
                code = %error.code(),
                error = %error,
                "tool loop failed"
            );
            let finish_reason = events.fail(&error);
            (TurnState::Failed, content, finish_reason)
        }
    };

    TurnOutcome {
        state,
        content,
        finish_reason,
        messages: request.messages,
        iterations,
        usage,
    }
}

fn interrupted(lifecycle: &RequestLifecycle, events: &TurnEvents, content: String) -> (TurnState, String, FinishReason) {
    let interruption = events.interrupted(lifecycle);
    (TurnState::from(interruption), content, interruption.finish_reason())
}

fn publish_answer(events: &TurnEvents, content: &str, finish_reason: FinishReason) {
    if !content.is_empty() {
        events.emit(ClientEvent::chunk(content));
    }
    events.done(finish_reason);
}
