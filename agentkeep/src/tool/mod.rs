//! Tool Router, Tool Scheduler, and Approval Gate.
//!
//! Grounded on `machi::tool`'s `ToolDefinition`/`DynTool`/`ToolExecutionPolicy`
//! family and on `agent::runner::Runner::execute_tool_calls`'s chunked
//! `join_all` concurrency pattern, generalized to the spec's deterministic
//! parallel/serial partitioning and scope-checked approval flow.

mod approval;
mod definition;
mod router;
mod scheduler;

pub use approval::ApprovalGate;
pub use definition::{BoxedToolHandler, ToolDefinition, ToolHandler};
pub use router::ToolRouter;
pub use scheduler::{ProposedCall, ToolOutcome, ToolScheduler};
