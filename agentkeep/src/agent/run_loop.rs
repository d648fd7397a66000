//! The Agent Loop: drives one run from its current step to a terminal or
//! suspended state.
//!
//! Grounded directly on `machi::agent::runner::{Runner, RunState}`: a per-run
//! state is assembled once per step (Observe/Retrieve/BuildContext), driven
//! through the model (Decide), and `process_step`'s three-way match
//! (`FinalOutput`/`ToolCalls`/`NeedsApproval`) becomes the Act branch below:
//! continue, suspend for approval, or suspend for children. See spec §4.8.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::agent::context::build_context;
use crate::agent::retrieval::MemoryStore;
use crate::config::RuntimeConfig;
use crate::error::{Result, RuntimeError};
use crate::ids::{AgentId, RunId, SpanId, ToolCallId};
use crate::llm::LlmAdapter;
use crate::llm::LlmChunk;
use crate::scope::Scope;
use crate::store::{CheckpointStore, EventLog, NewEvent, RunRepository};
use crate::tool::{ApprovalGate, ProposedCall, ToolDefinition, ToolOutcome, ToolRouter, ToolScheduler};
use crate::types::{
    CheckpointState, EventPayload, MessageRole, Redaction, Run, RunError, RunMessage, RunResult,
    SuspendReason,
};

/// History entries beyond this many (most recent) are dropped before the
/// Decide step, per spec §4.8's "oldest history dropped first".
const MAX_HISTORY_MESSAGES: usize = 40;

/// Used when a run carries no `system_prompt` in its `llm_config`.
const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful autonomous agent. Use the available tools when they help complete the task, and give a direct final answer when you are done.";

/// Tool names that are delegation primitives rather than ordinary tool
/// calls; recognizing them here (rather than per-tool metadata) keeps the
/// Tool Scheduler ignorant of swarm semantics, per spec §4.8 step 5.
fn delegation_kind(tool_name: &str) -> Option<DelegationKind> {
    match tool_name {
        "dispatch_subtasks" => Some(DelegationKind::DispatchSubtasks),
        "handoff_to" => Some(DelegationKind::HandoffTo),
        "escalate_to_group" => Some(DelegationKind::EscalateToGroup),
        _ => None,
    }
}

/// Which delegation primitive a proposed call invokes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelegationKind {
    /// Fan out to several independent child runs.
    DispatchSubtasks,
    /// Hand the whole task off to a single other agent persona.
    HandoffTo,
    /// Escalate to a swarm group for broader input.
    EscalateToGroup,
}

/// One delegation-primitive call proposed by the model, extracted from the
/// ordinary tool-call batch before it reaches the Tool Scheduler.
#[derive(Debug, Clone)]
pub struct DelegationRequest {
    /// Identity of the proposing call.
    pub tool_call_id: ToolCallId,
    /// Which primitive this is.
    pub kind: DelegationKind,
    /// The tool name as proposed (one of the three recognized primitives).
    pub tool_name: String,
    /// Arguments proposed for the call.
    pub args: Value,
}

/// The Swarm Coordinator's boundary as seen by the Agent Loop: create child
/// runs for a batch of delegation requests and return their ids.
#[async_trait]
pub trait Delegator: Send + Sync {
    /// Create children for `requests` under `run` and return their run ids.
    ///
    /// # Errors
    /// Returns `DELEGATION_CYCLE` if a request would delegate back to an
    /// ancestor, or `STORAGE_ERROR` on underlying failure.
    async fn delegate(
        &self,
        run: &Run,
        agent_id: &AgentId,
        requests: Vec<DelegationRequest>,
    ) -> Result<Vec<RunId>>;
}

/// Drives one run's step machine to completion, failure, cancellation, or
/// suspension. One instance is shared across all runs a worker drives.
pub struct AgentLoop {
    events: Arc<dyn EventLog>,
    runs: Arc<dyn RunRepository>,
    checkpoints: Arc<dyn CheckpointStore>,
    scheduler: ToolScheduler,
    router: Arc<ToolRouter>,
    gate: ApprovalGate,
    llm: Arc<dyn LlmAdapter>,
    memory: Arc<dyn MemoryStore>,
    delegator: Option<Arc<dyn Delegator>>,
    config: RuntimeConfig,
}

impl AgentLoop {
    /// Assemble the loop over its collaborators. Delegation primitives are
    /// rejected with `AGENT_ERROR` until [`AgentLoop::with_delegator`] is
    /// called.
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        events: Arc<dyn EventLog>,
        runs: Arc<dyn RunRepository>,
        checkpoints: Arc<dyn CheckpointStore>,
        scheduler: ToolScheduler,
        router: Arc<ToolRouter>,
        gate: ApprovalGate,
        llm: Arc<dyn LlmAdapter>,
        memory: Arc<dyn MemoryStore>,
        config: RuntimeConfig,
    ) -> Self {
        Self {
            events,
            runs,
            checkpoints,
            scheduler,
            router,
            gate,
            llm,
            memory,
            delegator: None,
            config,
        }
    }

    /// Attach a swarm coordinator so `dispatch_subtasks`/`handoff_to`/
    /// `escalate_to_group` calls can actually create children.
    #[must_use]
    pub fn with_delegator(mut self, delegator: Arc<dyn Delegator>) -> Self {
        self.delegator = Some(delegator);
        self
    }

    /// Drive `run` (already claimed and `running`) from its current step
    /// through to a terminal or suspended state.
    ///
    /// If a checkpoint exists for (run, agent), resumes from it and emits
    /// `run.resumed` before re-entering the loop; otherwise starts fresh at
    /// step 1 and emits `run.started`.
    ///
    /// # Errors
    /// Returns the terminating error when the run fails; `Ok(())` covers
    /// completion, cancellation, and suspension alike (the caller
    /// distinguishes outcomes by re-reading the run's status).
    pub async fn drive(&self, run: &Run, scope: &Scope, cancel: watch::Receiver<bool>) -> Result<()> {
        let span = info_span!("agent_run", run.id = %run.run_id, agent.id = %run.agent_id);
        self.drive_inner(run, scope, cancel).instrument(span).await
    }

    async fn drive_inner(
        &self,
        run: &Run,
        scope: &Scope,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<()> {
        let agent_id = &run.agent_id;
        let checkpoint = self.checkpoints.latest(&run.run_id, agent_id, scope).await?;

        let (mut step, mut ordinal) = if let Some(cp) = checkpoint {
            self.append_event(
                run,
                agent_id,
                cp.step_id,
                EventPayload::RunResumed {
                    summary: cp.state.working_summary.clone().unwrap_or_default(),
                },
            )
            .await?;
            (cp.step_id + 1, cp.state.message_ordinal)
        } else {
            self.append_event(run, agent_id, 0, EventPayload::RunStarted).await?;
            (1, 0)
        };

        let mut cumulative_tokens: u64 = 0;

        loop {
            if step > self.config.max_steps as u64 {
                return self
                    .terminate_failed(
                        run,
                        agent_id,
                        RuntimeError::MaxSteps {
                            max_steps: self.config.max_steps,
                        },
                    )
                    .await;
            }
            if *cancel.borrow() {
                return self.terminate_cancelled(run, scope).await;
            }

            let started_at = Instant::now();
            self.append_event(run, agent_id, step, EventPayload::StepStarted { step_number: step })
                .await?;
            debug!(run.id = %run.run_id, step, "starting agent-loop step");

            // Observe
            let history = self.runs.list_messages(&run.run_id, agent_id, scope).await?;

            // Retrieve
            let query = history
                .iter()
                .rev()
                .find(|m| m.role == MessageRole::User)
                .map_or_else(|| run.input.clone(), |m| m.content.clone());
            let retrieved = self
                .memory
                .retrieve(scope, &run.session_key, &query, 5)
                .await
                .unwrap_or_default();
            if !retrieved.is_empty() {
                self.append_event(
                    run,
                    agent_id,
                    step,
                    EventPayload::MemoryRetrieved {
                        count: retrieved.len(),
                    },
                )
                .await?;
            }

            // BuildContext
            let system_prompt = self.system_prompt_for(run);
            let ctx = build_context(&system_prompt, history, &retrieved, MAX_HISTORY_MESSAGES);

            // Decide
            let tool_defs: Vec<ToolDefinition> = self.router.definitions().into_iter().cloned().collect();
            let chunks = self.llm.generate_stream(&ctx.messages, &tool_defs).await?;

            let mut text = String::new();
            let mut proposed = Vec::new();
            let (mut prompt_tokens, mut completion_tokens) = (0u64, 0u64);
            for chunk in chunks {
                match chunk {
                    LlmChunk::Token(token) => {
                        self.append_event(run, agent_id, step, EventPayload::LlmToken { token: token.clone() })
                            .await?;
                        text.push_str(&token);
                    }
                    LlmChunk::ToolCalls(calls) => proposed.extend(calls),
                    LlmChunk::Done {
                        prompt_tokens: p,
                        completion_tokens: c,
                    } => {
                        prompt_tokens = p;
                        completion_tokens = c;
                    }
                }
            }
            cumulative_tokens += prompt_tokens + completion_tokens;
            self.append_event(
                run,
                agent_id,
                step,
                EventPayload::LlmCalled {
                    prompt_tokens,
                    completion_tokens,
                    duration_ms: elapsed_ms(started_at),
                },
            )
            .await?;

            // Act: commit the model's turn first, regardless of what it asked for.
            ordinal += 1;
            let tool_calls_value = if proposed.is_empty() {
                None
            } else {
                Some(serde_json::to_value(&proposed)?)
            };
            self.runs
                .append_message(RunMessage {
                    run_id: run.run_id.clone(),
                    agent_id: agent_id.clone(),
                    step_id: step,
                    ordinal,
                    role: MessageRole::Assistant,
                    content: text.clone(),
                    tool_call_id: None,
                    tool_calls: tool_calls_value,
                })
                .await?;

            if proposed.is_empty() {
                self.save_checkpoint(run, agent_id, step, ordinal, Some(text.clone())).await?;
                self.append_event(
                    run,
                    agent_id,
                    step,
                    EventPayload::StepCompleted {
                        step_number: step,
                        result_type: "final_output".into(),
                        duration_ms: elapsed_ms(started_at),
                    },
                )
                .await?;
                return self.terminate_completed(run, text).await;
            }

            let call_names: HashMap<ToolCallId, String> = proposed
                .iter()
                .map(|c| (c.tool_call_id.clone(), c.tool_name.clone()))
                .collect();
            let (delegations, direct): (Vec<_>, Vec<_>) =
                proposed.into_iter().partition(|c| delegation_kind(&c.tool_name).is_some());

            if !delegations.is_empty() {
                let requests = delegations
                    .into_iter()
                    .map(|c| DelegationRequest {
                        tool_call_id: c.tool_call_id,
                        kind: delegation_kind(&c.tool_name).expect("partitioned by delegation_kind"),
                        tool_name: c.tool_name,
                        args: c.args,
                    })
                    .collect();
                self.save_checkpoint(run, agent_id, step, ordinal, None).await?;
                return self.suspend_for_children(run, agent_id, requests).await;
            }

            let calls: Vec<ProposedCall> = direct
                .into_iter()
                .map(|c| ProposedCall {
                    tool_call_id: c.tool_call_id,
                    tool_name: c.tool_name,
                    args: c.args,
                })
                .collect();

            let outcomes = self
                .scheduler
                .run_batch(
                    &run.run_id,
                    agent_id,
                    step,
                    run.group_id.as_ref(),
                    calls,
                    self.router.as_ref(),
                    cancel.clone(),
                )
                .await?;

            let mut pending_approval: Option<(ToolCallId, String)> = None;
            for outcome in &outcomes {
                ordinal += 1;
                match outcome {
                    ToolOutcome::Completed { tool_call_id, result } => {
                        self.runs
                            .append_message(tool_message(run, agent_id, step, ordinal, tool_call_id, &result.to_string()))
                            .await?;
                    }
                    ToolOutcome::Failed {
                        tool_call_id,
                        message,
                        ..
                    } => {
                        self.runs
                            .append_message(tool_message(run, agent_id, step, ordinal, tool_call_id, message))
                            .await?;
                    }
                    ToolOutcome::Blocked { tool_call_id, reason } => {
                        self.runs
                            .append_message(tool_message(run, agent_id, step, ordinal, tool_call_id, reason))
                            .await?;
                    }
                    ToolOutcome::RequiresApproval { tool_call_id } => {
                        ordinal -= 1; // no message committed for an unresolved call
                        let tool_name = call_names.get(tool_call_id).cloned().unwrap_or_default();
                        pending_approval.get_or_insert((tool_call_id.clone(), tool_name));
                    }
                }
            }

            self.save_checkpoint(run, agent_id, step, ordinal, None).await?;
            self.append_event(
                run,
                agent_id,
                step,
                EventPayload::StepCompleted {
                    step_number: step,
                    result_type: "tool_calls".into(),
                    duration_ms: elapsed_ms(started_at),
                },
            )
            .await?;

            if let Some((_, tool_name)) = pending_approval {
                self.gate.suspend_for_approval(&run.run_id, agent_id, &tool_name).await?;
                return Ok(());
            }

            // Reflect
            if let Some(max_tokens) = self.config.max_tokens {
                if cumulative_tokens > max_tokens {
                    return self
                        .terminate_failed(
                            run,
                            agent_id,
                            RuntimeError::BudgetExceeded {
                                message: format!("exceeded {max_tokens} cumulative tokens"),
                            },
                        )
                        .await;
                }
            }
            step += 1;
        }
    }

    fn system_prompt_for(&self, run: &Run) -> String {
        run.llm_config
            .as_ref()
            .and_then(|cfg| cfg.get("system_prompt"))
            .and_then(Value::as_str)
            .map_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string(), str::to_string)
    }

    async fn save_checkpoint(
        &self,
        run: &Run,
        agent_id: &AgentId,
        step: u64,
        message_ordinal: u64,
        working_summary: Option<String>,
    ) -> Result<()> {
        self.checkpoints
            .save(
                &run.run_id,
                agent_id,
                step,
                CheckpointState {
                    plan: None,
                    working_summary,
                    tool_state: Value::Null,
                    context_cursor: None,
                    message_ordinal,
                },
            )
            .await?;
        self.append_event(run, agent_id, step, EventPayload::CheckpointSaved { step_id: step })
            .await
    }

    async fn append_event(
        &self,
        run: &Run,
        agent_id: &AgentId,
        step_id: u64,
        payload: EventPayload,
    ) -> Result<()> {
        self.events
            .append_one(NewEvent {
                run_id: run.run_id.clone(),
                agent_id: agent_id.clone(),
                step_id,
                span_id: SpanId::new(uuid::Uuid::new_v4().to_string()),
                parent_span_id: None,
                payload,
                redaction: Redaction::default(),
                group_id: run.group_id.clone(),
            })
            .await?;
        Ok(())
    }

    async fn terminate_completed(&self, run: &Run, output: String) -> Result<()> {
        self.append_event(
            run,
            &run.agent_id,
            0,
            EventPayload::RunCompleted {
                output: output.clone(),
            },
        )
        .await?;
        self.runs.complete(&run.run_id, RunResult { output }).await?;
        info!(run.id = %run.run_id, "run completed");
        Ok(())
    }

    async fn terminate_failed(&self, run: &Run, agent_id: &AgentId, err: RuntimeError) -> Result<()> {
        let run_error = RunError {
            code: err.code().to_string(),
            message: err.to_string(),
        };
        self.append_event(
            run,
            agent_id,
            0,
            EventPayload::RunFailed {
                code: run_error.code.clone(),
                message: run_error.message.clone(),
            },
        )
        .await?;
        self.runs.fail(&run.run_id, run_error).await?;
        warn!(run.id = %run.run_id, error = %err, "run failed");
        Err(err)
    }

    async fn terminate_cancelled(&self, run: &Run, scope: &Scope) -> Result<()> {
        self.append_event(run, &run.agent_id, 0, EventPayload::RunCancelled).await?;
        self.runs.cancel(&run.run_id, scope).await?;
        info!(run.id = %run.run_id, "run cancelled");
        Ok(())
    }

    async fn suspend_for_children(
        &self,
        run: &Run,
        agent_id: &AgentId,
        requests: Vec<DelegationRequest>,
    ) -> Result<()> {
        let Some(delegator) = self.delegator.clone() else {
            return self
                .terminate_failed(
                    run,
                    agent_id,
                    RuntimeError::agent("no swarm coordinator configured for delegation"),
                )
                .await;
        };
        let tool_name = requests.first().map_or_else(String::new, |r| r.tool_name.clone());
        let children = delegator.delegate(run, agent_id, requests).await?;
        self.runs.mark_suspended(&run.run_id, SuspendReason::AwaitingChildren).await?;
        self.append_event(
            run,
            agent_id,
            0,
            EventPayload::RunSuspended {
                tool_name,
                children,
            },
        )
        .await?;
        Ok(())
    }
}

fn tool_message(
    run: &Run,
    agent_id: &AgentId,
    step: u64,
    ordinal: u64,
    tool_call_id: &ToolCallId,
    content: &str,
) -> RunMessage {
    RunMessage {
        run_id: run.run_id.clone(),
        agent_id: agent_id.clone(),
        step_id: step,
        ordinal,
        role: MessageRole::Tool,
        content: content.to_string(),
        tool_call_id: Some(tool_call_id.clone()),
        tool_calls: None,
    }
}

fn elapsed_ms(started_at: Instant) -> u64 {
    u64::try_from(started_at.elapsed().as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::retrieval::NullMemoryStore;
    use crate::ids::SessionKey;
    use crate::llm::{MockLlmAdapter, ProposedToolCall};
    use crate::store::{NewRun, SqliteStore};
    use crate::tool::ToolHandler;

    struct Echo;

    #[async_trait]
    impl ToolHandler for Echo {
        async fn call(&self, args: Value) -> Result<Value> {
            Ok(args)
        }
    }

    fn tool_def(name: &str, requires_approval: bool, risk_level: &str) -> ToolDefinition {
        ToolDefinition {
            name: name.into(),
            description: "d".into(),
            parameters: serde_json::json!({}),
            mutating: false,
            supports_parallel: true,
            risk_level: risk_level.into(),
            timeout_ms: None,
            requires_approval,
            source: "builtin".into(),
        }
    }

    async fn build_loop(
        llm: MockLlmAdapter,
        router: ToolRouter,
        config: RuntimeConfig,
    ) -> (AgentLoop, Arc<SqliteStore>, RunId, Scope) {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let scope = Scope::new("org", "user");
        let run = store
            .create(NewRun {
                scope: scope.clone(),
                session_key: SessionKey::new("s"),
                group_id: None,
                input: "do the thing".into(),
                agent_id: AgentId::new("agent-default"),
                llm_config: None,
                parent_run_id: None,
                delegated_permissions: None,
            })
            .await
            .unwrap();
        store.claim_running(&run.run_id).await.unwrap();

        let agent_loop = AgentLoop::new(
            store.clone(),
            store.clone(),
            store.clone(),
            ToolScheduler::new(store.clone(), config.clone()),
            Arc::new(router),
            ApprovalGate::new(store.clone(), store.clone()),
            Arc::new(llm),
            Arc::new(NullMemoryStore),
            config,
        );
        (agent_loop, store, run.run_id, scope)
    }

    #[tokio::test]
    async fn completes_in_one_step_when_model_returns_final_text() {
        let llm = MockLlmAdapter::new(vec![vec![
            LlmChunk::Token("all done".into()),
            LlmChunk::Done {
                prompt_tokens: 5,
                completion_tokens: 2,
            },
        ]]);
        let (agent_loop, store, run_id, scope) =
            build_loop(llm, ToolRouter::new(), RuntimeConfig::default()).await;
        let (_tx, rx) = watch::channel(false);
        let run = store.get(&run_id, &scope).await.unwrap();

        agent_loop.drive(&run, &scope, rx).await.unwrap();

        let run = store.get(&run_id, &scope).await.unwrap();
        assert_eq!(run.status, crate::types::RunStatus::Completed);
        assert_eq!(run.result.unwrap().output, "all done");
    }

    #[tokio::test]
    async fn continues_after_tool_call_and_then_completes() {
        let llm = MockLlmAdapter::new(vec![
            vec![
                LlmChunk::ToolCalls(vec![ProposedToolCall {
                    tool_call_id: ToolCallId::new("tc-1"),
                    tool_name: "echo".into(),
                    args: serde_json::json!({"x": 1}),
                }]),
                LlmChunk::Done {
                    prompt_tokens: 5,
                    completion_tokens: 2,
                },
            ],
            vec![
                LlmChunk::Token("second step done".into()),
                LlmChunk::Done {
                    prompt_tokens: 5,
                    completion_tokens: 2,
                },
            ],
        ]);
        let mut router = ToolRouter::new();
        router.register(tool_def("echo", false, "low"), Box::new(Echo));
        let (agent_loop, store, run_id, scope) = build_loop(llm, router, RuntimeConfig::default()).await;
        let (_tx, rx) = watch::channel(false);
        let run = store.get(&run_id, &scope).await.unwrap();

        agent_loop.drive(&run, &scope, rx).await.unwrap();

        let run = store.get(&run_id, &scope).await.unwrap();
        assert_eq!(run.status, crate::types::RunStatus::Completed);
        assert_eq!(run.result.unwrap().output, "second step done");
    }

    #[tokio::test]
    async fn suspends_run_when_tool_requires_approval() {
        let llm = MockLlmAdapter::new(vec![vec![
            LlmChunk::ToolCalls(vec![ProposedToolCall {
                tool_call_id: ToolCallId::new("tc-1"),
                tool_name: "send_email".into(),
                args: serde_json::json!({}),
            }]),
            LlmChunk::Done {
                prompt_tokens: 5,
                completion_tokens: 2,
            },
        ]]);
        let mut router = ToolRouter::new();
        router.register(tool_def("send_email", true, "high"), Box::new(Echo));
        let (agent_loop, store, run_id, scope) = build_loop(llm, router, RuntimeConfig::default()).await;
        let (_tx, rx) = watch::channel(false);
        let run = store.get(&run_id, &scope).await.unwrap();

        agent_loop.drive(&run, &scope, rx).await.unwrap();

        let run = store.get(&run_id, &scope).await.unwrap();
        assert_eq!(run.status, crate::types::RunStatus::Suspended);
        assert_eq!(run.suspend_reason, Some(SuspendReason::AwaitingApproval));
    }

    #[tokio::test]
    async fn fails_with_max_steps_when_model_never_finishes() {
        let llm = MockLlmAdapter::new(vec![vec![
            LlmChunk::ToolCalls(vec![ProposedToolCall {
                tool_call_id: ToolCallId::new("tc-1"),
                tool_name: "echo".into(),
                args: serde_json::json!({}),
            }]),
            LlmChunk::Done {
                prompt_tokens: 1,
                completion_tokens: 1,
            },
        ]]);
        let mut router = ToolRouter::new();
        router.register(tool_def("echo", false, "low"), Box::new(Echo));
        let config = RuntimeConfig::new().with_max_steps(1);
        let (agent_loop, store, run_id, scope) = build_loop(llm, router, config).await;
        let (_tx, rx) = watch::channel(false);
        let run = store.get(&run_id, &scope).await.unwrap();

        let err = agent_loop.drive(&run, &scope, rx).await.unwrap_err();
        assert_eq!(err.code(), "MAX_STEPS");

        let run = store.get(&run_id, &scope).await.unwrap();
        assert_eq!(run.status, crate::types::RunStatus::Failed);
    }
}
