//! Approval Gate: suspends a run awaiting a high-risk tool call's decision
//! and resolves it once a decision arrives.
//!
//! The "pending" set is a derived view over the event log (no separate
//! table — see [`EventLog::pending_approvals`]); duplicate decisions are
//! rejected as `ALREADY_RESOLVED` rather than silently accepted.

use std::sync::Arc;

use serde_json::Value;

use crate::dispatcher::RunQueue;
use crate::error::{Result, RuntimeError};
use crate::ids::{AgentId, RunId, SpanId, ToolCallId};
use crate::scope::Scope;
use crate::store::{EventLog, NewEvent, RunRepository};
use crate::types::{EventPayload, Redaction, SuspendReason};

/// Suspends runs awaiting tool-approval decisions and resolves them.
pub struct ApprovalGate {
    events: Arc<dyn EventLog>,
    runs: Arc<dyn RunRepository>,
    enqueuer: Option<RunQueue>,
}

impl ApprovalGate {
    /// Build a gate over the shared event log and run repository. Without
    /// [`ApprovalGate::with_enqueuer`], a resolved decision returns the run
    /// to `pending` but does not re-submit it to the dispatcher.
    #[must_use]
    pub const fn new(events: Arc<dyn EventLog>, runs: Arc<dyn RunRepository>) -> Self {
        Self {
            events,
            runs,
            enqueuer: None,
        }
    }

    /// Attach a dispatcher queue handle so `approve`/`reject` re-submit the
    /// run once it returns to `pending`, per spec §4.2's "re-enters the
    /// dispatcher queue".
    #[must_use]
    pub fn with_enqueuer(mut self, enqueuer: RunQueue) -> Self {
        self.enqueuer = Some(enqueuer);
        self
    }

    async fn requeue(&self, run_id: &RunId, scope: &Scope) -> Result<()> {
        if let Some(enqueuer) = &self.enqueuer {
            enqueuer.enqueue(run_id.clone(), scope.clone()).await?;
        }
        Ok(())
    }

    /// Suspend `run_id` to await an approval decision. No-op (returns
    /// `false`) if the run is not currently `running`.
    ///
    /// # Errors
    /// Returns `NOT_FOUND` if the run does not exist.
    pub async fn suspend_for_approval(
        &self,
        run_id: &RunId,
        agent_id: &AgentId,
        tool_name: &str,
    ) -> Result<bool> {
        let suspended = self.runs.mark_suspended(run_id, SuspendReason::AwaitingApproval).await?;
        if suspended {
            self.events
                .append_one(NewEvent {
                    run_id: run_id.clone(),
                    agent_id: agent_id.clone(),
                    step_id: 0,
                    span_id: SpanId::new(uuid::Uuid::new_v4().to_string()),
                    parent_span_id: None,
                    payload: EventPayload::RunSuspended {
                        tool_name: tool_name.to_string(),
                        children: Vec::new(),
                    },
                    redaction: Redaction::default(),
                    group_id: None,
                })
                .await?;
        }
        Ok(suspended)
    }

    /// Approve a pending call, optionally substituting modified arguments.
    ///
    /// # Errors
    /// Returns `NOT_FOUND` if the call has no pending approval request under
    /// `scope`, or `ALREADY_RESOLVED` if it was already approved/rejected.
    pub async fn approve(
        &self,
        run_id: &RunId,
        agent_id: &AgentId,
        scope: &Scope,
        tool_call_id: &ToolCallId,
        modified_args: Option<Value>,
    ) -> Result<()> {
        self.require_pending(run_id, scope, tool_call_id).await?;

        self.events
            .append_one(NewEvent {
                run_id: run_id.clone(),
                agent_id: agent_id.clone(),
                step_id: 0,
                span_id: SpanId::new(uuid::Uuid::new_v4().to_string()),
                parent_span_id: None,
                payload: EventPayload::ToolApproved {
                    tool_call_id: tool_call_id.clone(),
                    modified_args_applied: modified_args.is_some(),
                },
                redaction: Redaction::default(),
                group_id: None,
            })
            .await?;

        self.runs.resume_from_suspended(run_id).await?;
        self.requeue(run_id, scope).await?;
        Ok(())
    }

    /// Reject a pending call.
    ///
    /// # Errors
    /// Returns `NOT_FOUND` if the call has no pending approval request under
    /// `scope`, or `ALREADY_RESOLVED` if it was already approved/rejected.
    pub async fn reject(
        &self,
        run_id: &RunId,
        agent_id: &AgentId,
        scope: &Scope,
        tool_call_id: &ToolCallId,
        reason: Option<String>,
    ) -> Result<()> {
        self.require_pending(run_id, scope, tool_call_id).await?;

        self.events
            .append_one(NewEvent {
                run_id: run_id.clone(),
                agent_id: agent_id.clone(),
                step_id: 0,
                span_id: SpanId::new(uuid::Uuid::new_v4().to_string()),
                parent_span_id: None,
                payload: EventPayload::ToolRejected {
                    tool_call_id: tool_call_id.clone(),
                    reason,
                },
                redaction: Redaction::default(),
                group_id: None,
            })
            .await?;

        self.runs.resume_from_suspended(run_id).await?;
        self.requeue(run_id, scope).await?;
        Ok(())
    }

    async fn require_pending(
        &self,
        run_id: &RunId,
        scope: &Scope,
        tool_call_id: &ToolCallId,
    ) -> Result<()> {
        let pending = self.events.pending_approvals(run_id, scope).await?;
        if pending.iter().any(|p| &p.tool_call_id == tool_call_id) {
            Ok(())
        } else {
            Err(RuntimeError::AlreadyResolved {
                message: format!("tool call '{tool_call_id}' has no pending approval"),
            })
        }
    }
}
