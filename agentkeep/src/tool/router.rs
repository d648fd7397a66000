//! Resolves tool names to handlers and validates declared metadata.

use std::collections::HashMap;

use serde_json::Value;

use crate::error::{Result, RuntimeError};

use super::definition::{BoxedToolHandler, ToolDefinition};

/// A registry of tool definitions and their handlers, keyed by name.
///
/// Grounded on how `Agent` resolves a call's `name` against `agent.tools` in
/// `agent::runner::Runner::execute_single_tool`, pulled out into its own
/// type so the Tool Scheduler doesn't need to know about agent configuration.
#[derive(Default)]
pub struct ToolRouter {
    entries: HashMap<String, (ToolDefinition, BoxedToolHandler)>,
}

impl ToolRouter {
    /// An empty router.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool. Replaces any prior registration under the same name.
    pub fn register(&mut self, definition: ToolDefinition, handler: BoxedToolHandler) {
        self.entries.insert(definition.name.clone(), (definition, handler));
    }

    /// All registered tool definitions, for inclusion in the LLM request.
    #[must_use]
    pub fn definitions(&self) -> Vec<&ToolDefinition> {
        self.entries.values().map(|(d, _)| d).collect()
    }

    /// Look up a tool's declared metadata.
    #[must_use]
    pub fn definition(&self, name: &str) -> Option<&ToolDefinition> {
        self.entries.get(name).map(|(d, _)| d)
    }

    /// Execute a registered tool by name.
    ///
    /// # Errors
    /// Returns `INVALID_INPUT` if no tool is registered under `name`, or
    /// whatever error the handler itself produces.
    pub async fn call(&self, name: &str, args: Value) -> Result<Value> {
        let (_, handler) = self
            .entries
            .get(name)
            .ok_or_else(|| RuntimeError::invalid_input(format!("unknown tool '{name}'")))?;
        handler.call(args).await
    }
}
