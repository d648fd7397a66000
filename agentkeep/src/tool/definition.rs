//! Tool metadata and the dynamic handler trait.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

/// Static metadata describing one tool available to an agent.
///
/// `mutating`, `supports_parallel`, and `risk_level` drive the Tool
/// Scheduler's parallel/serial partitioning and the Approval Gate's
/// suspend-for-approval decision; see [`ToolScheduler`](super::ToolScheduler).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[allow(clippy::struct_excessive_bools)]
pub struct ToolDefinition {
    /// Name of the tool (e.g. `"read_file"`).
    pub name: String,
    /// Description shown to the model.
    pub description: String,
    /// JSON schema for the tool's arguments.
    pub parameters: Value,
    /// True when the tool changes external state.
    pub mutating: bool,
    /// True when the tool may run concurrently with other calls.
    pub supports_parallel: bool,
    /// Declared risk tier (`"low"`, `"medium"`, `"high"`).
    pub risk_level: String,
    /// Per-call timeout; falls back to the runtime default when `None`.
    pub timeout_ms: Option<u64>,
    /// True when a `high` risk_level requires an external approval before running.
    pub requires_approval: bool,
    /// Where this tool was registered from (built-in, MCP server name, etc.),
    /// carried for observability only.
    pub source: String,
}

impl ToolDefinition {
    /// True when this tool is eligible for the parallel execution group, per
    /// the scheduler's partitioning rule: not mutating, declares parallel
    /// support, and is not `high` risk.
    #[must_use]
    pub fn is_parallel_eligible(&self) -> bool {
        !self.mutating && self.supports_parallel && self.risk_level != "high"
    }
}

/// The dynamic, object-safe tool execution interface.
///
/// Mirrors `machi::tool::DynTool::call_json`: arguments and results cross the
/// boundary as [`Value`] so heterogeneous tools can share one registry.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    /// Run the tool with the given JSON arguments.
    ///
    /// # Errors
    /// Returns [`crate::error::RuntimeError::ToolError`] on tool-local
    /// failure; this must never be used for framework-level errors.
    async fn call(&self, args: Value) -> Result<Value>;
}

/// A boxed [`ToolHandler`] for storage in the [`ToolRouter`](super::ToolRouter) registry.
pub type BoxedToolHandler = Box<dyn ToolHandler>;

#[cfg(test)]
mod tests {
    use super::*;

    fn def(mutating: bool, supports_parallel: bool, risk_level: &str) -> ToolDefinition {
        ToolDefinition {
            name: "t".into(),
            description: "d".into(),
            parameters: serde_json::json!({}),
            mutating,
            supports_parallel,
            risk_level: risk_level.into(),
            timeout_ms: None,
            requires_approval: false,
            source: "builtin".into(),
        }
    }

    #[test]
    fn parallel_eligible_requires_all_three_conditions() {
        assert!(def(false, true, "low").is_parallel_eligible());
        assert!(!def(true, true, "low").is_parallel_eligible());
        assert!(!def(false, false, "low").is_parallel_eligible());
        assert!(!def(false, true, "high").is_parallel_eligible());
    }
}
