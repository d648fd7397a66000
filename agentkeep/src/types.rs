//! Core data model: Run, Event, Checkpoint, RunMessage, RunDependency.
//!
//! Every type here derives `Serialize`/`Deserialize` and is stored as JSON
//! columns the way `SqliteSession::add_messages` serializes `Message` —
//! see `crate::store`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{AgentId, EventId, GroupId, RunId, SessionKey, SpanId, ToolCallId};
use crate::scope::Scope;

/// Lifecycle status of a [`Run`].
///
/// Transitions are enumerated in full in `crate::store::runs`; this type
/// only carries the discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Created, not yet claimed by a worker.
    Pending,
    /// Claimed and actively executing.
    Running,
    /// Awaiting external input injection.
    Waiting,
    /// Awaiting approval or child completion.
    Suspended,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Failed,
    /// Cancelled before reaching a terminal state.
    Cancelled,
}

impl RunStatus {
    /// True for states from which no further transition is possible.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// The reason a run is currently suspended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuspendReason {
    /// Waiting on a high-risk tool call's approval decision.
    AwaitingApproval,
    /// Waiting on one or more delegated child runs to settle.
    AwaitingChildren,
}

/// `{code, message}` recorded on a failed run and mirrored into its
/// `run.failed` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunError {
    /// Stable error code, see `crate::error::RuntimeError::code`.
    pub code: String,
    /// Human-readable message.
    pub message: String,
}

/// `{output}` recorded on a successfully completed run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    /// The run's final textual output.
    pub output: String,
}

/// A single task execution: the unit of persistence and streaming.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    /// Globally unique identity.
    pub run_id: RunId,
    /// Tenant boundary.
    pub scope: Scope,
    /// Conversation grouping key.
    pub session_key: SessionKey,
    /// Optional team/swarm grouping key.
    pub group_id: Option<GroupId>,
    /// The task input text.
    pub input: String,
    /// Which agent persona drives this run.
    pub agent_id: AgentId,
    /// Optional model configuration override, opaque to the runtime.
    pub llm_config: Option<serde_json::Value>,
    /// Parent run, if this run was created by delegation.
    pub parent_run_id: Option<RunId>,
    /// Permissions carried forward from the parent on delegation.
    pub delegated_permissions: Option<serde_json::Value>,
    /// Current lifecycle status.
    pub status: RunStatus,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// When a worker first claimed the run.
    pub started_at: Option<DateTime<Utc>>,
    /// When the run reached a terminal state.
    pub ended_at: Option<DateTime<Utc>>,
    /// When the run was cancelled.
    pub cancelled_at: Option<DateTime<Utc>>,
    /// When the run most recently entered `suspended`.
    pub suspended_at: Option<DateTime<Utc>>,
    /// Why the run is currently suspended, if it is.
    pub suspend_reason: Option<SuspendReason>,
    /// Present on successful completion.
    pub result: Option<RunResult>,
    /// Present on failure.
    pub error: Option<RunError>,
}

/// The closed set of events that may be appended to a run's log.
///
/// Modeled as a tagged union with a `type` discriminator on the wire,
/// rather than duck-typed JSON, per the spec's re-design note on dynamic
/// payload shapes. Each variant's wire tag is the dotted event name from
/// spec §3 (e.g. `"tool.called"`); payload fields are camelCase to match
/// the on-wire event example in spec §6.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
#[non_exhaustive]
pub enum EventPayload {
    /// Emitted once when a run transitions into `running` for the first time.
    #[serde(rename = "run.started")]
    RunStarted,
    /// Emitted on successful termination.
    #[serde(rename = "run.completed")]
    RunCompleted {
        /// The run's final output.
        output: String,
    },
    /// Emitted on failed termination.
    #[serde(rename = "run.failed")]
    RunFailed {
        /// Stable error code.
        code: String,
        /// Human-readable message.
        message: String,
    },
    /// Emitted on cancellation.
    #[serde(rename = "run.cancelled")]
    RunCancelled,
    /// Emitted when a run enters `suspended`.
    #[serde(rename = "run.suspended", rename_all = "camelCase")]
    RunSuspended {
        /// The tool call or mechanism that triggered suspension.
        tool_name: String,
        /// Child run ids, when suspended for delegation.
        children: Vec<RunId>,
    },
    /// Emitted when a suspended run resumes.
    #[serde(rename = "run.resumed")]
    RunResumed {
        /// Human-readable summary of what unblocked the run.
        summary: String,
    },
    /// Emitted at the start of each agent-loop step.
    #[serde(rename = "step.started", rename_all = "camelCase")]
    StepStarted {
        /// 1-based step number.
        step_number: u64,
    },
    /// Emitted at the end of each agent-loop step.
    #[serde(rename = "step.completed", rename_all = "camelCase")]
    StepCompleted {
        /// 1-based step number.
        step_number: u64,
        /// What the step produced.
        result_type: String,
        /// Wall-clock duration of the step.
        duration_ms: u64,
    },
    /// Emitted once the model call for a step completes.
    #[serde(rename = "llm.called", rename_all = "camelCase")]
    LlmCalled {
        /// Prompt tokens consumed.
        prompt_tokens: u64,
        /// Completion tokens produced.
        completion_tokens: u64,
        /// Wall-clock duration of the call.
        duration_ms: u64,
    },
    /// Emitted for each streamed token while the model is generating.
    #[serde(rename = "llm.token")]
    LlmToken {
        /// The partial token text.
        token: String,
    },
    /// Emitted once before a batch of tool calls begins executing, covering
    /// both the parallel-eligible and serial partitions of one proposal set.
    #[serde(rename = "tool.batch.started", rename_all = "camelCase")]
    ToolBatchStarted {
        /// Number of calls in the batch.
        call_count: usize,
    },
    /// Emitted once a batch of tool calls has fully settled.
    #[serde(rename = "tool.batch.completed", rename_all = "camelCase")]
    ToolBatchCompleted {
        /// Calls that completed without error.
        success_count: usize,
        /// Calls that ended in a tool-local error.
        failure_count: usize,
    },
    /// Emitted when a tool call is dispatched.
    #[serde(rename = "tool.called", rename_all = "camelCase")]
    ToolCalled {
        /// Tool call identity, for correlating with its result.
        tool_call_id: ToolCallId,
        /// Name of the tool.
        tool_name: String,
        /// Arguments passed to the tool.
        args: serde_json::Value,
    },
    /// Emitted when a tool call finishes, successfully or not.
    #[serde(rename = "tool.result", rename_all = "camelCase")]
    ToolResult {
        /// Tool call identity, for correlating with its call.
        tool_call_id: ToolCallId,
        /// Name of the tool.
        tool_name: String,
        /// The tool's return value, if it succeeded.
        result: Option<serde_json::Value>,
        /// Whether the call failed.
        is_error: bool,
        /// Error code, present when `is_error`.
        code: Option<String>,
    },
    /// Emitted when policy blocks a tool call before execution.
    #[serde(rename = "tool.blocked", rename_all = "camelCase")]
    ToolBlocked {
        /// Tool call identity.
        tool_call_id: ToolCallId,
        /// Name of the blocked tool.
        tool_name: String,
        /// Reason the policy blocked the call.
        reason: String,
    },
    /// Emitted instead of executing a high-risk tool call.
    #[serde(rename = "tool.requires_approval", rename_all = "camelCase")]
    ToolRequiresApproval {
        /// Tool call identity.
        tool_call_id: ToolCallId,
        /// Name of the tool awaiting approval.
        tool_name: String,
        /// Arguments the call would run with.
        args: serde_json::Value,
        /// Why approval is required.
        reason: String,
        /// The tool's declared risk level.
        risk_level: String,
    },
    /// Emitted when an external decision approves a pending call.
    #[serde(rename = "tool.approved", rename_all = "camelCase")]
    ToolApproved {
        /// Tool call identity.
        tool_call_id: ToolCallId,
        /// Whether the approver supplied modified arguments.
        modified_args_applied: bool,
    },
    /// Emitted when an external decision rejects a pending call.
    #[serde(rename = "tool.rejected", rename_all = "camelCase")]
    ToolRejected {
        /// Tool call identity.
        tool_call_id: ToolCallId,
        /// Reason given for the rejection, if any.
        reason: Option<String>,
    },
    /// Emitted when the agent loop writes to the memory store.
    #[serde(rename = "memory.written", rename_all = "camelCase")]
    MemoryWritten {
        /// Identifier of the written item, opaque to the runtime.
        item_id: String,
    },
    /// Emitted when the agent loop retrieves from the memory store.
    #[serde(rename = "memory.retrieved")]
    MemoryRetrieved {
        /// Number of items returned.
        count: usize,
    },
    /// Emitted when a checkpoint is persisted.
    #[serde(rename = "checkpoint.saved", rename_all = "camelCase")]
    CheckpointSaved {
        /// Step number the checkpoint was taken at.
        step_id: u64,
    },
    /// A task-kind structured message in a swarm conversation.
    #[serde(rename = "message.task")]
    MessageTask {
        /// Message body.
        content: serde_json::Value,
    },
    /// A proposal-kind structured message.
    #[serde(rename = "message.proposal")]
    MessageProposal {
        /// Message body.
        content: serde_json::Value,
    },
    /// A decision-kind structured message.
    #[serde(rename = "message.decision")]
    MessageDecision {
        /// Message body.
        content: serde_json::Value,
    },
    /// An evidence-kind structured message.
    #[serde(rename = "message.evidence")]
    MessageEvidence {
        /// Message body.
        content: serde_json::Value,
    },
    /// A status-kind structured message.
    #[serde(rename = "message.status")]
    MessageStatus {
        /// Message body.
        content: serde_json::Value,
    },
    /// Emitted when a user injects input into a waiting run.
    #[serde(rename = "user.injected")]
    UserInjected {
        /// The injected text.
        content: String,
    },
}

impl EventPayload {
    /// The closed-set wire discriminator for this event, matching spec §3's
    /// enumeration (`run.started`, `tool.result`, ...).
    #[must_use]
    pub const fn wire_type(&self) -> &'static str {
        match self {
            Self::RunStarted => "run.started",
            Self::RunCompleted { .. } => "run.completed",
            Self::RunFailed { .. } => "run.failed",
            Self::RunCancelled => "run.cancelled",
            Self::RunSuspended { .. } => "run.suspended",
            Self::RunResumed { .. } => "run.resumed",
            Self::StepStarted { .. } => "step.started",
            Self::StepCompleted { .. } => "step.completed",
            Self::LlmCalled { .. } => "llm.called",
            Self::LlmToken { .. } => "llm.token",
            Self::ToolBatchStarted { .. } => "tool.batch.started",
            Self::ToolBatchCompleted { .. } => "tool.batch.completed",
            Self::ToolCalled { .. } => "tool.called",
            Self::ToolResult { .. } => "tool.result",
            Self::ToolBlocked { .. } => "tool.blocked",
            Self::ToolRequiresApproval { .. } => "tool.requires_approval",
            Self::ToolApproved { .. } => "tool.approved",
            Self::ToolRejected { .. } => "tool.rejected",
            Self::MemoryWritten { .. } => "memory.written",
            Self::MemoryRetrieved { .. } => "memory.retrieved",
            Self::CheckpointSaved { .. } => "checkpoint.saved",
            Self::MessageTask { .. } => "message.task",
            Self::MessageProposal { .. } => "message.proposal",
            Self::MessageDecision { .. } => "message.decision",
            Self::MessageEvidence { .. } => "message.evidence",
            Self::MessageStatus { .. } => "message.status",
            Self::UserInjected { .. } => "user.injected",
        }
    }

    /// True for the three terminal event kinds; at most one may exist per run.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::RunCompleted { .. } | Self::RunFailed { .. } | Self::RunCancelled
        )
    }
}

/// Redaction marker recorded alongside every event payload.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Redaction {
    /// Set by the caller before append when the payload contains secrets.
    pub contains_secrets: bool,
}

/// An immutable fact appended during a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Monotonically increasing id, unique within storage.
    pub id: EventId,
    /// The run this event belongs to.
    pub run_id: RunId,
    /// Wall-clock time of append.
    pub ts: DateTime<Utc>,
    /// Which agent persona produced this event.
    pub agent_id: AgentId,
    /// Step the event was produced during.
    pub step_id: u64,
    /// Unique within the run; identifies the action this event records.
    pub span_id: SpanId,
    /// The span that caused this one, if any.
    pub parent_span_id: Option<SpanId>,
    /// The tagged event body.
    pub payload: EventPayload,
    /// Schema version, currently 1.
    pub v: u32,
    /// Secret-redaction marker.
    pub redaction: Redaction,
    /// Swarm grouping, carried from the run.
    pub group_id: Option<GroupId>,
}

/// A recoverable snapshot of agent state persisted at step boundaries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Storage-assigned identity; "latest" is the highest id for (run, agent).
    pub id: u64,
    /// The run this checkpoint belongs to.
    pub run_id: RunId,
    /// The agent persona that produced it.
    pub agent_id: AgentId,
    /// Step number the checkpoint was taken at.
    pub step_id: u64,
    /// Opaque snapshot: plan, working summary, tool state, context cursor,
    /// message ordinal.
    pub state: CheckpointState,
    /// When the checkpoint was written.
    pub created_at: DateTime<Utc>,
}

/// The opaque contents of a [`Checkpoint`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckpointState {
    /// Free-form plan text, if the agent maintains one.
    pub plan: Option<String>,
    /// A running summary substituted for trimmed history.
    pub working_summary: Option<String>,
    /// Opaque per-tool state carried across steps.
    pub tool_state: serde_json::Value,
    /// Cursor into retrieved context items, for resumed retrieval.
    pub context_cursor: Option<u64>,
    /// Ordinal of the last committed [`RunMessage`].
    pub message_ordinal: u64,
}

/// One role in a reconstructed model-turn history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    /// The system prompt.
    System,
    /// The end user or upstream caller.
    User,
    /// The model.
    Assistant,
    /// A tool's result, addressed back to a prior assistant tool call.
    Tool,
}

/// A reconstructed model-turn entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMessage {
    /// The run this message belongs to.
    pub run_id: RunId,
    /// The agent persona that produced or consumed it.
    pub agent_id: AgentId,
    /// Step this message was committed during.
    pub step_id: u64,
    /// Strictly increasing per (run, agent); no gaps.
    pub ordinal: u64,
    /// Which party this turn speaks for.
    pub role: MessageRole,
    /// Turn content.
    pub content: String,
    /// Present on `Tool` messages, correlating to the triggering call.
    pub tool_call_id: Option<ToolCallId>,
    /// Present on `Assistant` messages that proposed tool calls.
    pub tool_calls: Option<serde_json::Value>,
}

/// Status of a [`RunDependency`] edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyStatus {
    /// The child has not yet settled.
    Pending,
    /// The child completed successfully.
    Completed,
    /// The child failed.
    Failed,
}

/// One parent-child edge in a swarm delegation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunDependency {
    /// Storage-assigned identity.
    pub id: u64,
    /// The delegating run.
    pub parent_run_id: RunId,
    /// The delegated run.
    pub child_run_id: RunId,
    /// The tool call that triggered this delegation.
    pub tool_call_id: ToolCallId,
    /// Optional role/persona assigned to the child within the swarm.
    pub role_id: Option<String>,
    /// The subtask goal given to the child.
    pub goal: String,
    /// Settlement status.
    pub status: DependencyStatus,
    /// Present once the child completes successfully.
    pub result: Option<serde_json::Value>,
    /// Present if the child fails.
    pub error: Option<RunError>,
    /// When this dependency row was created.
    pub created_at: DateTime<Utc>,
    /// When the child settled.
    pub completed_at: Option<DateTime<Utc>>,
}

/// A derived view over events: a `tool.requires_approval` with no subsequent
/// `tool.approved`/`tool.rejected` for the same `tool_call_id`. Never
/// persisted as its own row, per spec §3.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingApproval {
    /// The run the pending call belongs to.
    pub run_id: RunId,
    /// Identity of the awaiting call.
    pub tool_call_id: ToolCallId,
    /// Name of the tool awaiting approval.
    pub tool_name: String,
    /// Arguments the call would run with.
    pub args: serde_json::Value,
    /// Why approval is required.
    pub reason: String,
    /// The tool's declared risk level.
    pub risk_level: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_status_terminal_states() {
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(RunStatus::Cancelled.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
        assert!(!RunStatus::Suspended.is_terminal());
    }

    #[test]
    fn event_payload_wire_type_matches_closed_enumeration() {
        assert_eq!(EventPayload::RunStarted.wire_type(), "run.started");
        assert_eq!(
            EventPayload::ToolRejected {
                tool_call_id: ToolCallId::new("tc-1"),
                reason: None
            }
            .wire_type(),
            "tool.rejected"
        );
        assert_eq!(
            EventPayload::ToolBatchStarted { call_count: 3 }.wire_type(),
            "tool.batch.started"
        );
        assert_eq!(
            EventPayload::ToolBatchCompleted {
                success_count: 2,
                failure_count: 1
            }
            .wire_type(),
            "tool.batch.completed"
        );
    }

    #[test]
    fn only_three_payload_kinds_are_terminal() {
        assert!(EventPayload::RunCancelled.is_terminal());
        assert!(EventPayload::RunCompleted {
            output: "ok".into()
        }
        .is_terminal());
        assert!(!EventPayload::RunStarted.is_terminal());
        assert!(!EventPayload::StepStarted { step_number: 1 }.is_terminal());
    }

    #[test]
    fn event_serializes_with_tagged_wire_shape() {
        let event = Event {
            id: EventId::new(1),
            run_id: RunId::new("run-1"),
            ts: Utc::now(),
            agent_id: AgentId::new("agent-1"),
            step_id: 1,
            span_id: SpanId::new("sp-1"),
            parent_span_id: None,
            payload: EventPayload::ToolCalled {
                tool_call_id: ToolCallId::new("tc-1"),
                tool_name: "read_file".into(),
                args: serde_json::json!({"path": "a.txt"}),
            },
            v: 1,
            redaction: Redaction::default(),
            group_id: None,
        };
        let value = serde_json::to_value(&event).expect("serializes");
        assert_eq!(value["payload"]["type"], "tool.called");
        assert_eq!(value["payload"]["payload"]["toolName"], "read_file");
    }
}
