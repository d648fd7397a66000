//! Swarm Coordinator: turns a delegation-primitive call into one or more
//! child runs, and resumes the parent once they settle.
//!
//! Grounded on `machi::agent::ManagedAgentRegistry`'s parent/managed-agent
//! split, generalized from an in-process call into a full child [`Run`]
//! created through [`RunRepository`], so delegation survives process
//! restarts like everything else in this runtime. Cycle detection walks
//! [`RunRepository::ancestor_chain`] rather than tracking a call stack, since
//! a delegation chain may span separate worker processes.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::agent::{DelegationKind, DelegationRequest, Delegator};
use crate::dispatcher::RunQueue;
use crate::error::{Result, RuntimeError};
use crate::ids::{AgentId, GroupId, RunId};
use crate::store::{DependencyStatus, EventLog, NewEvent, NewRun, RunRepository};
use crate::types::{EventPayload, Redaction, Run, RunError};

/// One child task extracted from a `dispatch_subtasks`/`handoff_to`/
/// `escalate_to_group` call's arguments.
#[derive(Debug, Clone)]
struct ChildSpec {
    agent_id: AgentId,
    goal: String,
    role_id: Option<String>,
}

/// Creates child runs for delegation primitives and settles fan-in when they
/// complete.
pub struct SwarmCoordinator {
    runs: Arc<dyn RunRepository>,
    events: Arc<dyn EventLog>,
    enqueuer: Option<RunQueue>,
}

impl SwarmCoordinator {
    /// Build a coordinator over the shared run repository and event log.
    /// Without [`SwarmCoordinator::with_enqueuer`], children are created
    /// `pending` but never submitted, and a settled parent is never
    /// re-queued — both require a dispatcher queue handle.
    #[must_use]
    pub const fn new(runs: Arc<dyn RunRepository>, events: Arc<dyn EventLog>) -> Self {
        Self {
            runs,
            events,
            enqueuer: None,
        }
    }

    /// Attach a dispatcher queue handle so newly delegated children are
    /// submitted to run, and a fanned-in parent re-enters the dispatcher
    /// queue, per spec §4.6 step 2 / §4.9.
    #[must_use]
    pub fn with_enqueuer(mut self, enqueuer: RunQueue) -> Self {
        self.enqueuer = Some(enqueuer);
        self
    }

    /// Report one child's settlement to its parent, resuming the parent from
    /// `suspended` exactly once all siblings have settled. See spec §4.6.
    ///
    /// # Errors
    /// Returns `NOT_FOUND` if `child_run_id` has no dependency row.
    pub async fn report_settlement(
        &self,
        child_run_id: &RunId,
        status: DependencyStatus,
        result: Option<Value>,
        error: Option<RunError>,
    ) -> Result<()> {
        let outcome = self
            .runs
            .complete_dependency_atomic(child_run_id, status, result, error)
            .await?;

        if outcome.pending_count == 0 {
            let parent_run_id = &outcome.dependency.parent_run_id;
            self.runs.resume_from_suspended(parent_run_id).await?;
            self.events
                .append_one(NewEvent {
                    run_id: parent_run_id.clone(),
                    agent_id: AgentId::new("swarm-coordinator"),
                    step_id: 0,
                    span_id: crate::ids::SpanId::new(uuid::Uuid::new_v4().to_string()),
                    parent_span_id: None,
                    payload: EventPayload::RunResumed {
                        summary: "all delegated children settled".to_string(),
                    },
                    redaction: Redaction::default(),
                    group_id: None,
                })
                .await?;
            if let Some(enqueuer) = &self.enqueuer {
                let scope = self.runs.scope_of(parent_run_id).await?;
                enqueuer.enqueue(parent_run_id.clone(), scope).await?;
            }
        }
        Ok(())
    }

    fn children_from_args(kind: DelegationKind, args: &Value) -> Result<Vec<ChildSpec>> {
        match kind {
            DelegationKind::DispatchSubtasks => {
                let tasks = args
                    .get("subtasks")
                    .and_then(Value::as_array)
                    .ok_or_else(|| RuntimeError::invalid_input("dispatch_subtasks requires a 'subtasks' array"))?;
                tasks
                    .iter()
                    .map(|t| {
                        let agent_id = t
                            .get("agent_id")
                            .and_then(Value::as_str)
                            .ok_or_else(|| RuntimeError::invalid_input("subtask missing 'agent_id'"))?;
                        let goal = t
                            .get("goal")
                            .and_then(Value::as_str)
                            .ok_or_else(|| RuntimeError::invalid_input("subtask missing 'goal'"))?;
                        Ok(ChildSpec {
                            agent_id: AgentId::new(agent_id),
                            goal: goal.to_string(),
                            role_id: t.get("role_id").and_then(Value::as_str).map(str::to_string),
                        })
                    })
                    .collect()
            }
            DelegationKind::HandoffTo => {
                let agent_id = args
                    .get("agent_id")
                    .and_then(Value::as_str)
                    .ok_or_else(|| RuntimeError::invalid_input("handoff_to requires an 'agent_id'"))?;
                let goal = args
                    .get("goal")
                    .and_then(Value::as_str)
                    .ok_or_else(|| RuntimeError::invalid_input("handoff_to requires a 'goal'"))?;
                Ok(vec![ChildSpec {
                    agent_id: AgentId::new(agent_id),
                    goal: goal.to_string(),
                    role_id: None,
                }])
            }
            DelegationKind::EscalateToGroup => {
                let members = args
                    .get("members")
                    .and_then(Value::as_array)
                    .ok_or_else(|| RuntimeError::invalid_input("escalate_to_group requires a 'members' array"))?;
                let goal = args
                    .get("goal")
                    .and_then(Value::as_str)
                    .ok_or_else(|| RuntimeError::invalid_input("escalate_to_group requires a 'goal'"))?;
                members
                    .iter()
                    .map(|m| {
                        let agent_id = m
                            .as_str()
                            .ok_or_else(|| RuntimeError::invalid_input("group member must be an agent id string"))?;
                        Ok(ChildSpec {
                            agent_id: AgentId::new(agent_id),
                            goal: goal.to_string(),
                            role_id: Some(agent_id.to_string()),
                        })
                    })
                    .collect()
            }
        }
    }
}

#[async_trait]
impl Delegator for SwarmCoordinator {
    async fn delegate(
        &self,
        run: &Run,
        agent_id: &AgentId,
        requests: Vec<DelegationRequest>,
    ) -> Result<Vec<RunId>> {
        let ancestor_ids = self.runs.ancestor_chain(&run.run_id).await?;
        let mut ancestor_agents = Vec::with_capacity(ancestor_ids.len() + 1);
        ancestor_agents.push(agent_id.clone());
        for ancestor_id in &ancestor_ids {
            ancestor_agents.push(self.runs.get(ancestor_id, &run.scope).await?.agent_id);
        }
        let group_id = run.group_id.clone().unwrap_or_else(|| GroupId::new(run.run_id.as_str()));
        let mut children = Vec::new();

        for request in requests {
            for spec in Self::children_from_args(request.kind, &request.args)? {
                if ancestor_agents.contains(&spec.agent_id) {
                    return Err(RuntimeError::DelegationCycle {
                        run_id: run.run_id.as_str().to_string(),
                    });
                }

                let child = self
                    .runs
                    .create(NewRun {
                        scope: run.scope.clone(),
                        session_key: run.session_key.clone(),
                        group_id: Some(group_id.clone()),
                        input: spec.goal.clone(),
                        agent_id: spec.agent_id,
                        llm_config: run.llm_config.clone(),
                        parent_run_id: Some(run.run_id.clone()),
                        delegated_permissions: run.delegated_permissions.clone(),
                    })
                    .await?;
                self.runs
                    .create_dependency(
                        &run.run_id,
                        &child.run_id,
                        &request.tool_call_id,
                        spec.role_id,
                        spec.goal,
                    )
                    .await?;
                if let Some(enqueuer) = &self.enqueuer {
                    enqueuer.enqueue(child.run_id.clone(), run.scope.clone()).await?;
                }
                children.push(child.run_id);
            }
        }

        Ok(children)
    }
}
