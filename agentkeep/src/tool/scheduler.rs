//! Partitions a step's proposed tool calls into parallel/serial groups and
//! executes them against the event log.
//!
//! Grounded on `agent::runner::Runner::execute_tool_calls`'s chunked
//! `futures::future::join_all` concurrency, generalized to the spec's
//! deterministic partitioning rule and per-call timeout/approval handling.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::watch;
use tracing::{info_span, warn, Instrument};

use crate::config::RuntimeConfig;
use crate::error::{Result, RuntimeError};
use crate::ids::{AgentId, GroupId, RunId, SpanId, ToolCallId};
use crate::store::{EventLog, NewEvent};
use crate::types::{EventPayload, Redaction};

use super::router::ToolRouter;

/// One tool call proposed by the model for the current step.
#[derive(Debug, Clone)]
pub struct ProposedCall {
    /// Identity, for correlating the call with its result.
    pub tool_call_id: ToolCallId,
    /// Name of the tool to invoke.
    pub tool_name: String,
    /// Arguments to pass.
    pub args: Value,
}

/// The settled outcome of one proposed call.
#[derive(Debug, Clone)]
pub enum ToolOutcome {
    /// The tool ran and returned a value.
    Completed {
        /// Identity of the settled call.
        tool_call_id: ToolCallId,
        /// The tool's return value.
        result: Value,
    },
    /// The tool ran and failed.
    Failed {
        /// Identity of the settled call.
        tool_call_id: ToolCallId,
        /// Stable error code.
        code: String,
        /// Human-readable message.
        message: String,
    },
    /// The call was blocked by policy before execution.
    Blocked {
        /// Identity of the blocked call.
        tool_call_id: ToolCallId,
        /// Reason the policy blocked it.
        reason: String,
    },
    /// The call is high-risk and must be routed through the Approval Gate
    /// instead of executing; the caller is responsible for suspending the run.
    RequiresApproval {
        /// Identity of the awaiting call.
        tool_call_id: ToolCallId,
    },
}

impl ToolOutcome {
    /// Identity of the call this outcome settles.
    #[must_use]
    pub const fn tool_call_id(&self) -> &ToolCallId {
        match self {
            Self::Completed { tool_call_id, .. }
            | Self::Failed { tool_call_id, .. }
            | Self::Blocked { tool_call_id, .. }
            | Self::RequiresApproval { tool_call_id } => tool_call_id,
        }
    }
}

/// Executes one step's proposed tool calls, honoring the scheduler's
/// deterministic parallel/serial partitioning. See spec §4.4.
pub struct ToolScheduler {
    events: Arc<dyn EventLog>,
    config: RuntimeConfig,
}

impl ToolScheduler {
    /// Build a scheduler over a shared event log and runtime configuration.
    #[must_use]
    pub const fn new(events: Arc<dyn EventLog>, config: RuntimeConfig) -> Self {
        Self { events, config }
    }

    /// Run `calls` to completion: parallel-eligible calls first, in chunks
    /// of `config.parallel_limit`, then the remaining serial calls in
    /// proposal order. Emits `tool.batch.started`/`tool.batch.completed`
    /// around the whole batch and `tool.called`/`tool.result`/`tool.blocked`
    /// per call.
    ///
    /// A call whose definition sets `requires_approval` is neither executed
    /// nor counted toward success/failure; it yields
    /// [`ToolOutcome::RequiresApproval`] so the caller can suspend the run.
    ///
    /// # Errors
    /// Returns `STORAGE_ERROR` if event persistence fails.
    #[allow(clippy::too_many_arguments)]
    pub async fn run_batch(
        &self,
        run_id: &RunId,
        agent_id: &AgentId,
        step_id: u64,
        group_id: Option<&GroupId>,
        calls: Vec<ProposedCall>,
        router: &ToolRouter,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<Vec<ToolOutcome>> {
        self.events
            .append_one(NewEvent {
                run_id: run_id.clone(),
                agent_id: agent_id.clone(),
                step_id,
                span_id: SpanId::new(uuid::Uuid::new_v4().to_string()),
                parent_span_id: None,
                payload: EventPayload::ToolBatchStarted {
                    call_count: calls.len(),
                },
                redaction: Redaction::default(),
                group_id: group_id.cloned(),
            })
            .await?;

        let (parallel, serial): (Vec<_>, Vec<_>) = calls.into_iter().partition(|call| {
            router
                .definition(&call.tool_name)
                .is_some_and(super::definition::ToolDefinition::is_parallel_eligible)
        });

        let mut outcomes = Vec::new();

        for chunk in parallel.chunks(self.config.parallel_limit.max(1)) {
            if *cancel.borrow() {
                break;
            }
            let futs = chunk
                .iter()
                .map(|call| self.run_one(run_id, agent_id, step_id, group_id, call, router));
            outcomes.extend(futures::future::join_all(futs).await);
        }

        for call in &serial {
            if *cancel.borrow() {
                break;
            }
            outcomes.push(self.run_one(run_id, agent_id, step_id, group_id, call, router).await);
        }

        let success_count = outcomes
            .iter()
            .filter(|o| matches!(o, ToolOutcome::Completed { .. }))
            .count();
        let failure_count = outcomes
            .iter()
            .filter(|o| matches!(o, ToolOutcome::Failed { .. }))
            .count();

        self.events
            .append_one(NewEvent {
                run_id: run_id.clone(),
                agent_id: agent_id.clone(),
                step_id,
                span_id: SpanId::new(uuid::Uuid::new_v4().to_string()),
                parent_span_id: None,
                payload: EventPayload::ToolBatchCompleted {
                    success_count,
                    failure_count,
                },
                redaction: Redaction::default(),
                group_id: group_id.cloned(),
            })
            .await?;

        Ok(outcomes)
    }

    async fn run_one(
        &self,
        run_id: &RunId,
        agent_id: &AgentId,
        step_id: u64,
        group_id: Option<&GroupId>,
        call: &ProposedCall,
        router: &ToolRouter,
    ) -> ToolOutcome {
        let span = info_span!("tool_call", tool.name = %call.tool_name, tool.id = %call.tool_call_id);
        self.run_one_inner(run_id, agent_id, step_id, group_id, call, router)
            .instrument(span)
            .await
    }

    async fn run_one_inner(
        &self,
        run_id: &RunId,
        agent_id: &AgentId,
        step_id: u64,
        group_id: Option<&GroupId>,
        call: &ProposedCall,
        router: &ToolRouter,
    ) -> ToolOutcome {
        let call_span = SpanId::new(uuid::Uuid::new_v4().to_string());

        let definition = router.definition(&call.tool_name).cloned();

        let _ = self
            .events
            .append_one(NewEvent {
                run_id: run_id.clone(),
                agent_id: agent_id.clone(),
                step_id,
                span_id: call_span.clone(),
                parent_span_id: None,
                payload: EventPayload::ToolCalled {
                    tool_call_id: call.tool_call_id.clone(),
                    tool_name: call.tool_name.clone(),
                    args: call.args.clone(),
                },
                redaction: Redaction::default(),
                group_id: group_id.cloned(),
            })
            .await;

        if definition.as_ref().is_some_and(|d| d.risk_level == "high" || d.requires_approval) {
            let reason = "high-risk tool requires external approval".to_string();
            let risk_level = definition
                .as_ref()
                .map_or_else(|| "high".to_string(), |d| d.risk_level.clone());
            let _ = self
                .events
                .append_one(NewEvent {
                    run_id: run_id.clone(),
                    agent_id: agent_id.clone(),
                    step_id,
                    span_id: SpanId::new(uuid::Uuid::new_v4().to_string()),
                    parent_span_id: Some(call_span),
                    payload: EventPayload::ToolRequiresApproval {
                        tool_call_id: call.tool_call_id.clone(),
                        tool_name: call.tool_name.clone(),
                        args: call.args.clone(),
                        reason,
                        risk_level,
                    },
                    redaction: Redaction::default(),
                    group_id: group_id.cloned(),
                })
                .await;
            return ToolOutcome::RequiresApproval {
                tool_call_id: call.tool_call_id.clone(),
            };
        }

        let timeout_ms = definition
            .as_ref()
            .and_then(|d| d.timeout_ms)
            .unwrap_or(self.config.default_tool_timeout_ms);

        let outcome = match tokio::time::timeout(
            Duration::from_millis(timeout_ms),
            router.call(&call.tool_name, call.args.clone()),
        )
        .await
        {
            Ok(Ok(result)) => ToolOutcome::Completed {
                tool_call_id: call.tool_call_id.clone(),
                result,
            },
            Ok(Err(err)) => {
                warn!(tool = %call.tool_name, error = %err, "tool call failed");
                ToolOutcome::Failed {
                    tool_call_id: call.tool_call_id.clone(),
                    code: err.code().to_string(),
                    message: err.to_string(),
                }
            }
            Err(_) => {
                let err = RuntimeError::Timeout {
                    tool_name: call.tool_name.clone(),
                };
                ToolOutcome::Failed {
                    tool_call_id: call.tool_call_id.clone(),
                    code: err.code().to_string(),
                    message: err.to_string(),
                }
            }
        };

        let result_payload = match &outcome {
            ToolOutcome::Completed { result, .. } => EventPayload::ToolResult {
                tool_call_id: call.tool_call_id.clone(),
                tool_name: call.tool_name.clone(),
                result: Some(result.clone()),
                is_error: false,
                code: None,
            },
            ToolOutcome::Failed { code, .. } => EventPayload::ToolResult {
                tool_call_id: call.tool_call_id.clone(),
                tool_name: call.tool_name.clone(),
                result: None,
                is_error: true,
                code: Some(code.clone()),
            },
            ToolOutcome::Blocked { .. } | ToolOutcome::RequiresApproval { .. } => unreachable!(
                "run_one_inner only produces Completed/Failed after the approval branch returns"
            ),
        };

        let _ = self
            .events
            .append_one(NewEvent {
                run_id: run_id.clone(),
                agent_id: agent_id.clone(),
                step_id,
                span_id: SpanId::new(uuid::Uuid::new_v4().to_string()),
                parent_span_id: Some(call_span),
                payload: result_payload,
                redaction: Redaction::default(),
                group_id: group_id.cloned(),
            })
            .await;

        outcome
    }
}
