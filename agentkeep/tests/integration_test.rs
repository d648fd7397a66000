//! End-to-end tests driving a run through the full stack: dispatcher,
//! agent loop, tool scheduler, and swarm delegation, all against an
//! in-memory `SqliteStore`.

#![allow(clippy::unwrap_used)]

use std::sync::Arc;
use std::time::Duration;

use agentkeep::prelude::*;
use async_trait::async_trait;
use serde_json::Value;

struct UppercaseTool;

#[async_trait]
impl ToolHandler for UppercaseTool {
    async fn call(&self, args: Value) -> Result<Value> {
        let text = args
            .get("text")
            .and_then(Value::as_str)
            .ok_or_else(|| RuntimeError::invalid_input("missing 'text'"))?;
        Ok(Value::String(text.to_uppercase()))
    }
}

fn uppercase_def() -> ToolDefinition {
    ToolDefinition {
        name: "uppercase".into(),
        description: "Uppercases the given text.".into(),
        parameters: serde_json::json!({
            "type": "object",
            "properties": { "text": { "type": "string" } },
            "required": ["text"],
        }),
        mutating: false,
        supports_parallel: true,
        risk_level: "low".into(),
        timeout_ms: None,
        requires_approval: false,
        source: "builtin".into(),
    }
}

#[tokio::test]
async fn run_completes_end_to_end_through_the_dispatcher() {
    let store = Arc::new(SqliteStore::in_memory().unwrap());
    let scope = Scope::new("acme", "alice");
    let run = store
        .create(NewRun {
            scope: scope.clone(),
            session_key: SessionKey::new("session-1"),
            group_id: None,
            input: "shout hello".into(),
            agent_id: AgentId::new("agent-default"),
            llm_config: None,
            parent_run_id: None,
            delegated_permissions: None,
        })
        .await
        .unwrap();

    let mut router = ToolRouter::new();
    router.register(uppercase_def(), Box::new(UppercaseTool));

    let llm = MockLlmAdapter::new(vec![
        vec![LlmChunk::ToolCalls(vec![ProposedToolCall {
            tool_call_id: ToolCallId::new("tc-1"),
            tool_name: "uppercase".into(),
            args: serde_json::json!({ "text": "hello" }),
        }])],
        vec![
            LlmChunk::Token("done: HELLO".into()),
            LlmChunk::Done {
                prompt_tokens: 5,
                completion_tokens: 3,
            },
        ],
    ]);

    let config = RuntimeConfig::default();
    let agent_loop = Arc::new(AgentLoop::new(
        store.clone(),
        store.clone(),
        store.clone(),
        ToolScheduler::new(store.clone(), config.clone()),
        Arc::new(router),
        ApprovalGate::new(store.clone(), store.clone()),
        Arc::new(llm),
        Arc::new(NullMemoryStore),
        config.clone(),
    ));

    let (queue, queue_rx) = RunQueue::channel(config.dispatcher_queue);
    let dispatcher = Dispatcher::spawn(queue, queue_rx, store.clone(), agent_loop, config);
    dispatcher
        .submit(Submission {
            run_id: run.run_id.clone(),
            scope: scope.clone(),
        })
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;

    let finished = store.get(&run.run_id, &scope).await.unwrap();
    assert_eq!(finished.status, RunStatus::Completed);
}

#[tokio::test]
async fn delegated_child_fan_in_resumes_the_parent() {
    let store = Arc::new(SqliteStore::in_memory().unwrap());
    let scope = Scope::new("acme", "alice");
    let parent = store
        .create(NewRun {
            scope: scope.clone(),
            session_key: SessionKey::new("session-1"),
            group_id: None,
            input: "plan a launch".into(),
            agent_id: AgentId::new("agent-default"),
            llm_config: None,
            parent_run_id: None,
            delegated_permissions: None,
        })
        .await
        .unwrap();
    store.claim_running(&parent.run_id).await.unwrap();
    let parent = store.get(&parent.run_id, &scope).await.unwrap();

    let coordinator = SwarmCoordinator::new(store.clone(), store.clone());
    let requests = vec![DelegationRequest {
        tool_call_id: ToolCallId::new("tc-1"),
        kind: DelegationKind::HandoffTo,
        tool_name: "handoff_to".into(),
        args: serde_json::json!({ "agent_id": "specialist", "goal": "draft the plan" }),
    }];
    let children = coordinator
        .delegate(&parent, &AgentId::new("agent-default"), requests)
        .await
        .unwrap();
    store.mark_suspended(&parent.run_id, SuspendReason::AwaitingChildren).await.unwrap();

    assert_eq!(children.len(), 1);
    coordinator
        .report_settlement(
            &children[0],
            DependencyStatus::Completed,
            Some(serde_json::json!("the plan")),
            None,
        )
        .await
        .unwrap();

    let resumed = store.get(&parent.run_id, &scope).await.unwrap();
    assert_eq!(resumed.status, RunStatus::Pending);
}

fn send_email_def() -> ToolDefinition {
    ToolDefinition {
        name: "send_email".into(),
        description: "Sends an email.".into(),
        parameters: serde_json::json!({"type": "object"}),
        mutating: true,
        supports_parallel: false,
        risk_level: "high".into(),
        timeout_ms: None,
        requires_approval: false,
        source: "builtin".into(),
    }
}

struct NoopEmail;

#[async_trait]
impl ToolHandler for NoopEmail {
    async fn call(&self, args: Value) -> Result<Value> {
        Ok(args)
    }
}

#[tokio::test]
async fn approving_a_suspended_run_redrives_it_through_the_dispatcher() {
    let store = Arc::new(SqliteStore::in_memory().unwrap());
    let scope = Scope::new("acme", "alice");
    let run = store
        .create(NewRun {
            scope: scope.clone(),
            session_key: SessionKey::new("session-1"),
            group_id: None,
            input: "send the launch email".into(),
            agent_id: AgentId::new("agent-default"),
            llm_config: None,
            parent_run_id: None,
            delegated_permissions: None,
        })
        .await
        .unwrap();

    let mut router = ToolRouter::new();
    router.register(send_email_def(), Box::new(NoopEmail));

    let llm = MockLlmAdapter::new(vec![
        vec![LlmChunk::ToolCalls(vec![ProposedToolCall {
            tool_call_id: ToolCallId::new("tc-1"),
            tool_name: "send_email".into(),
            args: serde_json::json!({}),
        }])],
        vec![
            LlmChunk::Token("done: sent".into()),
            LlmChunk::Done {
                prompt_tokens: 5,
                completion_tokens: 3,
            },
        ],
    ]);

    let config = RuntimeConfig::default();
    let (queue, queue_rx) = RunQueue::channel(config.dispatcher_queue);
    let gate = ApprovalGate::new(store.clone(), store.clone()).with_enqueuer(queue.clone());
    let agent_loop = Arc::new(AgentLoop::new(
        store.clone(),
        store.clone(),
        store.clone(),
        ToolScheduler::new(store.clone(), config.clone()),
        Arc::new(router),
        gate,
        Arc::new(llm),
        Arc::new(NullMemoryStore),
        config.clone(),
    ));
    let dispatcher = Dispatcher::spawn(queue.clone(), queue_rx, store.clone(), agent_loop, config);

    dispatcher
        .submit(Submission {
            run_id: run.run_id.clone(),
            scope: scope.clone(),
        })
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let suspended = store.get(&run.run_id, &scope).await.unwrap();
    assert_eq!(suspended.status, RunStatus::Suspended);

    // A second gate instance, sharing the same queue, stands in for whatever
    // process handles the approval decision (e.g. an HTTP handler).
    let deciding_gate = ApprovalGate::new(store.clone(), store.clone()).with_enqueuer(queue);
    deciding_gate
        .approve(&run.run_id, &AgentId::new("agent-default"), &scope, &ToolCallId::new("tc-1"), None)
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;

    let finished = store.get(&run.run_id, &scope).await.unwrap();
    assert_eq!(finished.status, RunStatus::Completed);
}

#[tokio::test]
async fn delegated_children_run_through_the_dispatcher_and_settlement_redrives_the_parent() {
    let store = Arc::new(SqliteStore::in_memory().unwrap());
    let scope = Scope::new("acme", "alice");
    let parent = store
        .create(NewRun {
            scope: scope.clone(),
            session_key: SessionKey::new("session-1"),
            group_id: None,
            input: "plan a launch".into(),
            agent_id: AgentId::new("agent-default"),
            llm_config: None,
            parent_run_id: None,
            delegated_permissions: None,
        })
        .await
        .unwrap();

    let llm = MockLlmAdapter::new(vec![
        vec![LlmChunk::ToolCalls(vec![ProposedToolCall {
            tool_call_id: ToolCallId::new("tc-1"),
            tool_name: "handoff_to".into(),
            args: serde_json::json!({ "agent_id": "specialist", "goal": "draft the plan" }),
        }])],
        vec![
            LlmChunk::Token("draft ready".into()),
            LlmChunk::Done {
                prompt_tokens: 2,
                completion_tokens: 2,
            },
        ],
        vec![
            LlmChunk::Token("launch plan complete".into()),
            LlmChunk::Done {
                prompt_tokens: 2,
                completion_tokens: 2,
            },
        ],
    ]);

    let config = RuntimeConfig::default();
    let (queue, queue_rx) = RunQueue::channel(config.dispatcher_queue);
    let coordinator = Arc::new(SwarmCoordinator::new(store.clone(), store.clone()).with_enqueuer(queue.clone()));
    let agent_loop = Arc::new(
        AgentLoop::new(
            store.clone(),
            store.clone(),
            store.clone(),
            ToolScheduler::new(store.clone(), config.clone()),
            Arc::new(ToolRouter::new()),
            ApprovalGate::new(store.clone(), store.clone()),
            Arc::new(llm),
            Arc::new(NullMemoryStore),
            config.clone(),
        )
        .with_delegator(coordinator.clone()),
    );
    let dispatcher = Dispatcher::spawn(queue, queue_rx, store.clone(), agent_loop, config);

    dispatcher
        .submit(Submission {
            run_id: parent.run_id.clone(),
            scope: scope.clone(),
        })
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let suspended = store.get(&parent.run_id, &scope).await.unwrap();
    assert_eq!(suspended.status, RunStatus::Suspended);
    let children = store.list_children(&parent.run_id).await.unwrap();
    assert_eq!(children.len(), 1);

    let child_id = children[0].child_run_id.clone();
    let child = store.get(&child_id, &scope).await.unwrap();
    assert_eq!(child.status, RunStatus::Completed);

    coordinator
        .report_settlement(
            &child_id,
            DependencyStatus::Completed,
            child.result.map(|r| serde_json::json!(r.output)),
            None,
        )
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let resumed = store.get(&parent.run_id, &scope).await.unwrap();
    assert_eq!(resumed.status, RunStatus::Completed);
}

#[tokio::test]
async fn subscriber_sees_events_published_through_the_bus() {
    use futures::StreamExt;

    let sqlite = Arc::new(SqliteStore::in_memory().unwrap());
    let scope = Scope::new("acme", "alice");
    let run = sqlite
        .create(NewRun {
            scope: scope.clone(),
            session_key: SessionKey::new("session-1"),
            group_id: None,
            input: "hi".into(),
            agent_id: AgentId::new("agent-default"),
            llm_config: None,
            parent_run_id: None,
            delegated_permissions: None,
        })
        .await
        .unwrap();

    let bus = Arc::new(EventBus::default());
    let mut subscription = bus.subscribe(&run.run_id);
    let log: Arc<dyn EventLog> = Arc::new(BusEventLog::new(sqlite, bus));

    log.append_one(NewEvent {
        run_id: run.run_id.clone(),
        agent_id: AgentId::new("agent-default"),
        step_id: 1,
        span_id: SpanId::new("sp-1"),
        parent_span_id: None,
        payload: EventPayload::RunStarted,
        redaction: Redaction::default(),
        group_id: None,
    })
    .await
    .unwrap();

    let event = subscription.next().await.unwrap();
    assert_eq!(event.run_id, run.run_id);
}
