//! Persistence: Event Log, Run Repository, Checkpoint Store.
//!
//! The three stores are exposed as traits so the Agent Loop and Swarm
//! Coordinator depend on an interface rather than a concrete backend; the
//! one implementation shipped here ([`sqlite::SqliteStore`]) is grounded on
//! `machi::memory::sqlite::SqliteSession`: a `rusqlite::Connection` wrapped
//! in `Arc<Mutex<_>>`, with blocking calls bridged through
//! `tokio::task::spawn_blocking`.

mod sqlite;

pub use sqlite::SqliteStore;

use async_trait::async_trait;

use crate::error::Result;
use crate::ids::{AgentId, EventId, RunId, SessionKey, ToolCallId};
use crate::scope::Scope;
use crate::types::{
    Checkpoint, CheckpointState, DependencyStatus, Event, EventPayload, PendingApproval, Run,
    RunDependency, RunError, RunMessage, RunResult, RunStatus, SuspendReason,
};

/// One page of an ordered event read, per spec §4.1 cursor semantics.
#[derive(Debug, Clone)]
pub struct EventPage {
    /// Events with `id > after_id`, ascending, up to `limit` long.
    pub items: Vec<Event>,
    /// Last returned id, or `None` when fewer than `limit` rows came back.
    pub next_cursor: Option<EventId>,
}

/// A draft event, not yet assigned an id. Built by callers (the Agent Loop,
/// Swarm Coordinator, Approval Gate) and handed to [`EventLog::append_one`].
#[derive(Debug, Clone)]
pub struct NewEvent {
    /// The run this event belongs to.
    pub run_id: RunId,
    /// Which agent persona produced this event.
    pub agent_id: AgentId,
    /// Step the event was produced during.
    pub step_id: u64,
    /// Unique within the run; identifies the action this event records.
    pub span_id: crate::ids::SpanId,
    /// The span that caused this one, if any.
    pub parent_span_id: Option<crate::ids::SpanId>,
    /// The tagged event body.
    pub payload: EventPayload,
    /// Secret-redaction marker; callers must set this before append.
    pub redaction: crate::types::Redaction,
    /// Swarm grouping, carried from the run.
    pub group_id: Option<crate::ids::GroupId>,
}

/// Append-only, per-run ordered event persistence with monotonic ids and
/// cursor pagination. See spec §4.1.
#[async_trait]
pub trait EventLog: Send + Sync {
    /// Insert one event, returning its assigned monotonic id.
    ///
    /// # Errors
    /// Returns `STORAGE_ERROR` on underlying failure. Callers must not
    /// retry without idempotency keying; none exists in this runtime, so
    /// retries risk at-least-once duplication.
    async fn append_one(&self, event: NewEvent) -> Result<EventId>;

    /// Insert a batch of events in a single transaction, returning ids in
    /// insertion order.
    ///
    /// # Errors
    /// Returns `STORAGE_ERROR` on underlying failure; the whole batch is
    /// rolled back.
    async fn append_many(&self, events: Vec<NewEvent>) -> Result<Vec<EventId>>;

    /// Read up to `limit` events for `run_id` with `id > after_id`,
    /// ascending. `exclude_types` filters out matching wire-type strings
    /// (used to implement `include_tokens=false`, dropping `llm.token`).
    ///
    /// # Errors
    /// Returns `NOT_FOUND` when `run_id` is not visible under `scope`.
    async fn read_page(
        &self,
        run_id: &RunId,
        scope: &Scope,
        after_id: Option<EventId>,
        limit: usize,
        exclude_types: &[&str],
    ) -> Result<EventPage>;

    /// Derived view: every `tool.requires_approval` event with no
    /// subsequent `tool.approved`/`tool.rejected` for the same
    /// `tool_call_id`. Never persisted as its own row, per spec §3.
    ///
    /// # Errors
    /// Returns `NOT_FOUND` when `run_id` is not visible under `scope`.
    async fn pending_approvals(&self, run_id: &RunId, scope: &Scope)
        -> Result<Vec<PendingApproval>>;
}

/// Creation parameters for a new [`Run`]. Grouped into one struct to avoid
/// an unwieldy `create` parameter list.
#[derive(Debug, Clone)]
pub struct NewRun {
    /// Tenant boundary; recorded as-is, never inherited from another row.
    pub scope: Scope,
    /// Conversation grouping key.
    pub session_key: SessionKey,
    /// Optional team/swarm grouping key.
    pub group_id: Option<crate::ids::GroupId>,
    /// The task input text.
    pub input: String,
    /// Which agent persona drives this run.
    pub agent_id: AgentId,
    /// Optional model configuration override, opaque to the runtime.
    pub llm_config: Option<serde_json::Value>,
    /// Parent run, if this run is created by delegation.
    pub parent_run_id: Option<RunId>,
    /// Permissions carried forward from the parent on delegation.
    pub delegated_permissions: Option<serde_json::Value>,
}

/// Outcome of [`RunRepository::complete_dependency_atomic`]: the updated
/// dependency row and how many siblings remain pending after the update.
#[derive(Debug, Clone)]
pub struct FanInOutcome {
    /// The dependency row that was just settled.
    pub dependency: RunDependency,
    /// Siblings of the same parent still `pending` after this update.
    pub pending_count: u64,
}

/// A completed, top-level run's contribution to session history, per
/// [`RunRepository::list_session_history`].
#[derive(Debug, Clone)]
pub struct HistoryEntry {
    /// The run's identity.
    pub run_id: RunId,
    /// The task input text.
    pub input: String,
    /// The run's final output, if it completed successfully.
    pub output: Option<String>,
}

/// Lifecycle operations on [`Run`] and [`RunDependency`] rows. See spec
/// §4.2; all transitions are conditional updates (no-op unless the run is
/// in the expected prior state).
#[async_trait]
pub trait RunRepository: Send + Sync {
    /// Create a new run with status `pending`.
    ///
    /// # Errors
    /// Returns `STORAGE_ERROR` on underlying failure.
    async fn create(&self, new_run: NewRun) -> Result<Run>;

    /// Fetch a run by id, scope-checked.
    ///
    /// # Errors
    /// Returns `NOT_FOUND` when the run does not exist or is not visible
    /// under `scope`.
    async fn get(&self, run_id: &RunId, scope: &Scope) -> Result<Run>;

    /// `pending -> running`; sets `started_at`. No-op if not pending.
    ///
    /// # Errors
    /// Returns `NOT_FOUND` when the run does not exist.
    async fn claim_running(&self, run_id: &RunId) -> Result<bool>;

    /// `running -> waiting`.
    ///
    /// # Errors
    /// Returns `NOT_FOUND` when the run does not exist.
    async fn mark_waiting(&self, run_id: &RunId) -> Result<bool>;

    /// `waiting -> running`.
    ///
    /// # Errors
    /// Returns `NOT_FOUND` when the run does not exist.
    async fn resume_from_waiting(&self, run_id: &RunId) -> Result<bool>;

    /// `running -> suspended`; sets `suspended_at`, `suspend_reason`.
    ///
    /// # Errors
    /// Returns `NOT_FOUND` when the run does not exist.
    async fn mark_suspended(&self, run_id: &RunId, reason: SuspendReason) -> Result<bool>;

    /// `suspended -> pending`; clears suspend fields.
    ///
    /// # Errors
    /// Returns `NOT_FOUND` when the run does not exist.
    async fn resume_from_suspended(&self, run_id: &RunId) -> Result<bool>;

    /// `running -> completed`; sets `ended_at`, `result`.
    ///
    /// # Errors
    /// Returns `NOT_FOUND` when the run does not exist.
    async fn complete(&self, run_id: &RunId, output: RunResult) -> Result<bool>;

    /// `running -> failed`; sets `ended_at`, `error`.
    ///
    /// # Errors
    /// Returns `NOT_FOUND` when the run does not exist.
    async fn fail(&self, run_id: &RunId, error: RunError) -> Result<bool>;

    /// `{pending, running, waiting, suspended} -> cancelled`, scope-checked.
    ///
    /// # Errors
    /// Returns `NOT_FOUND` when the run does not exist or is not visible
    /// under `scope`.
    async fn cancel(&self, run_id: &RunId, scope: &Scope) -> Result<bool>;

    /// Create a `pending` dependency edge from `parent` to `child`.
    ///
    /// # Errors
    /// Returns `STORAGE_ERROR` on underlying failure.
    async fn create_dependency(
        &self,
        parent: &RunId,
        child: &RunId,
        tool_call_id: &ToolCallId,
        role_id: Option<String>,
        goal: String,
    ) -> Result<RunDependency>;

    /// Atomically settle one dependency and report remaining pending
    /// siblings, under a lock on the whole sibling set. See spec §4.6.
    ///
    /// # Errors
    /// Returns `NOT_FOUND` when no dependency row matches `child_run_id`.
    async fn complete_dependency_atomic(
        &self,
        child_run_id: &RunId,
        status: DependencyStatus,
        result: Option<serde_json::Value>,
        error: Option<RunError>,
    ) -> Result<FanInOutcome>;

    /// Completed, top-level runs (`parent_run_id` is null) for `session_key`
    /// in chronological order, for assembling conversational context.
    ///
    /// # Errors
    /// Returns `STORAGE_ERROR` on underlying failure.
    async fn list_session_history(
        &self,
        scope: &Scope,
        session_key: &SessionKey,
        limit: usize,
    ) -> Result<Vec<HistoryEntry>>;

    /// Direct descendants of `parent_run_id`, ordered by creation time.
    ///
    /// # Errors
    /// Returns `STORAGE_ERROR` on underlying failure.
    async fn list_children(&self, parent_run_id: &RunId) -> Result<Vec<RunDependency>>;

    /// Walk the `parent_run_id` chain from `run_id` upward, for
    /// `DELEGATION_CYCLE` detection in the Swarm Coordinator.
    ///
    /// # Errors
    /// Returns `STORAGE_ERROR` on underlying failure.
    async fn ancestor_chain(&self, run_id: &RunId) -> Result<Vec<RunId>>;

    /// A run's scope, with no visibility check against a caller-supplied
    /// scope. Used internally by the Swarm Coordinator and Approval Gate to
    /// re-enqueue a run they have already authorized access to through some
    /// other path (a settled dependency, a resolved approval) — not a
    /// client-facing read.
    ///
    /// # Errors
    /// Returns `NOT_FOUND` when the run does not exist.
    async fn scope_of(&self, run_id: &RunId) -> Result<Scope>;

    /// Persist one [`RunMessage`], scope implied by `message.run_id`'s
    /// parent run.
    ///
    /// # Errors
    /// Returns `STORAGE_ERROR` on underlying failure, or `INVALID_INPUT` if
    /// `ordinal` would create a gap.
    async fn append_message(&self, message: RunMessage) -> Result<()>;

    /// Read the reconstructed message history for (run, agent), scope-checked.
    ///
    /// # Errors
    /// Returns `NOT_FOUND` when the run does not exist or is not visible
    /// under `scope`.
    async fn list_messages(
        &self,
        run_id: &RunId,
        agent_id: &AgentId,
        scope: &Scope,
    ) -> Result<Vec<RunMessage>>;
}

/// Snapshots of resumable agent state keyed by (run, agent, step). See
/// spec §4.1 component table and §4.8's Commit/resume steps.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Persist one checkpoint row for (run, agent, step).
    ///
    /// # Errors
    /// Returns `STORAGE_ERROR` on underlying failure.
    async fn save(
        &self,
        run_id: &RunId,
        agent_id: &AgentId,
        step_id: u64,
        state: CheckpointState,
    ) -> Result<Checkpoint>;

    /// The highest-id checkpoint for (run, agent), if any, scope-checked.
    ///
    /// # Errors
    /// Returns `NOT_FOUND` when the run does not exist or is not visible
    /// under `scope`.
    async fn latest(
        &self,
        run_id: &RunId,
        agent_id: &AgentId,
        scope: &Scope,
    ) -> Result<Option<Checkpoint>>;
}
