//! Tool dispatch for the agentic loop

mod arguments;

use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use indexmap::IndexMap;
use serde_json::Value;

pub use self::arguments::parse_arguments;
use crate::events::{ClientEvent, EventSink};
use crate::types::{ToolDefinition, ToolSpec};

/// Context handed to a tool for one invocation
#[derive(Clone)]
pub struct ToolContext {
    pub conversation_id: String,
    pub user_id: Option<String>,
    pub tool_call_id: String,
    /// Sink for the conversation, so a tool can stream output itself
    pub sink: Arc<dyn EventSink>,
}

impl ToolContext {
    /// Publish an event to the conversation's client
    pub fn publish(&self, event: ClientEvent) {
        self.sink.publish(&self.conversation_id, event);
    }
}

impl std::fmt::Debug for ToolContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolContext")
            .field("conversation_id", &self.conversation_id)
            .field("user_id", &self.user_id)
            .field("tool_call_id", &self.tool_call_id)
            .finish_non_exhaustive()
    }
}

/// Executes tool calls requested by the model
#[async_trait]
pub trait ToolRunner: Send + Sync {
    /// Run `tool_name` with already-parsed arguments
    async fn run(&self, tool_name: &str, arguments: Value, context: &ToolContext) -> anyhow::Result<Value>;
}

/// A single tool
#[async_trait]
pub trait Tool: Send + Sync {
    fn definition(&self) -> ToolDefinition;

    /// Whether the tool's output answers the user directly
    fn passthrough(&self) -> bool {
        false
    }

    async fn call(&self, arguments: Value, context: &ToolContext) -> anyhow::Result<Value>;
}

/// Tools keyed by name, usable directly as a [`ToolRunner`]
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: IndexMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool, replacing any tool with the same name
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.definition().name().to_owned();
        if self.tools.insert(name.clone(), tool).is_some() {
            tracing::debug!(tool = %name, "replaced registered tool");
        }
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.get(name)
    }

    /// Specs for every registered tool, in registration order
    pub fn specs(&self) -> Vec<ToolSpec> {
        self.tools
            .values()
            .map(|tool| ToolSpec {
                definition: tool.definition(),
                passthrough: tool.passthrough(),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

#[async_trait]
impl ToolRunner for ToolRegistry {
    async fn run(&self, tool_name: &str, arguments: Value, context: &ToolContext) -> anyhow::Result<Value> {
        let tool = self.tools.get(tool_name).ok_or_else(|| anyhow!("unknown tool: {tool_name}"))?;
        tool.call(arguments, context).await
    }
}
