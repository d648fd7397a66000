//! Re-exports the types most callers need to drive a run end to end.

pub use crate::agent::{
    AgentContext, AgentLoop, DelegationKind, DelegationRequest, Delegator, MemoryItem,
    MemoryStore, NullMemoryStore,
};
pub use crate::bus::{BusEventLog, EventBus};
pub use crate::config::RuntimeConfig;
pub use crate::dispatcher::{Dispatcher, RunQueue, Submission};
pub use crate::error::{Result, RuntimeError};
pub use crate::ids::{AgentId, EventId, GroupId, RunId, SessionKey, SpanId, ToolCallId};
pub use crate::llm::{LlmAdapter, LlmChunk, MockLlmAdapter, ProposedToolCall};
pub use crate::scope::{require_scope, Scope};
pub use crate::store::{
    CheckpointStore, EventLog, EventPage, FanInOutcome, HistoryEntry, NewEvent, NewRun,
    RunRepository, SqliteStore,
};
pub use crate::swarm::SwarmCoordinator;
pub use crate::tool::{
    ApprovalGate, BoxedToolHandler, ProposedCall, ToolDefinition, ToolHandler, ToolOutcome,
    ToolRouter, ToolScheduler,
};
pub use crate::types::{
    Checkpoint, CheckpointState, DependencyStatus, Event, EventPayload, MessageRole,
    PendingApproval, Redaction, Run, RunDependency, RunError, RunMessage, RunResult, RunStatus,
    SuspendReason,
};
