//! Reassembly of streamed tool-call fragments
//!
//! Providers split a tool call across many events: the first usually names
//! the function, later ones carry slices of the argument JSON. Fragments are
//! merged by their `index`.
//!
//! Some providers open a call with a placeholder `"{}"` and then stream the
//! real arguments. A placeholder is treated as empty, so the first real
//! slice replaces it instead of being appended to it.

use std::collections::HashMap;

use serde_json::Value;

use crate::types::{FunctionCall, THOUGHT_SIGNATURE_KEY, ToolCall, ToolCallFragment};
use crate::types::message::default_tool_type;

/// Placeholder argument text some providers send before the real arguments
const EMPTY_ARGUMENTS: &str = "{}";

/// Merges tool-call fragments of one model response
#[derive(Debug, Default)]
pub struct ToolCallAccumulator {
    /// Calls in order of first appearance
    calls: Vec<ToolCall>,
    /// Fragment index -> position in `calls`
    positions: HashMap<u32, usize>,
}

impl ToolCallAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge one event's fragments
    pub fn merge(&mut self, fragments: &[ToolCallFragment]) {
        for fragment in fragments {
            self.merge_one(fragment);
        }
    }

    fn merge_one(&mut self, fragment: &ToolCallFragment) {
        let Some(index) = fragment.index else {
            tracing::debug!(id = ?fragment.id, "ignoring tool call fragment without index");
            return;
        };

        let text = fragment.argument_text().unwrap_or_default();

        if let Some(&position) = self.positions.get(&index) {
            let call = &mut self.calls[position];

            if let Some(id) = &fragment.id {
                call.id = Some(id.clone());
            }
            if let Some(tool_type) = &fragment.tool_type {
                call.tool_type.clone_from(tool_type);
            }
            if let Some(name) = fragment.name().filter(|n| !n.is_empty()) {
                name.clone_into(&mut call.function.name);
            }
            for (key, value) in &fragment.metadata {
                call.metadata.insert(key.clone(), value.clone());
            }

            let arguments = &mut call.function.arguments;
            if arguments.is_empty() || arguments.as_str() == EMPTY_ARGUMENTS {
                if !text.is_empty() {
                    text.clone_into(arguments);
                }
            } else if !text.is_empty() && text != EMPTY_ARGUMENTS {
                arguments.push_str(text);
            }
            return;
        }

        let arguments = if text == EMPTY_ARGUMENTS { "" } else { text };

        self.positions.insert(index, self.calls.len());
        self.calls.push(ToolCall {
            index,
            id: fragment.id.clone(),
            tool_type: fragment.tool_type.clone().unwrap_or_else(default_tool_type),
            function: FunctionCall {
                name: fragment.name().unwrap_or_default().to_owned(),
                arguments: arguments.to_owned(),
            },
            metadata: fragment.metadata.clone(),
        });
    }

    /// Calls merged so far, in order of first appearance
    pub fn calls(&self) -> &[ToolCall] {
        &self.calls
    }

    /// Thought signatures carried by the calls, in call order
    pub fn thought_signatures(&self) -> Vec<String> {
        self.calls
            .iter()
            .filter_map(|c| c.metadata.get(THOUGHT_SIGNATURE_KEY).and_then(Value::as_str))
            .map(str::to_owned)
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    pub fn into_calls(self) -> Vec<ToolCall> {
        self.calls
    }
}
