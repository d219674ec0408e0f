use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::broadcast::Receiver;

use conductor_context::{ContextPackBuilder, RetrievalClient};
use conductor_core::{
    BroadcastBus, BusSubscribers, CheckpointManager, DeliveryCoordinator, EngineConfig,
    EngineError, EventBus, MessageBus, MemoryStore, NullDeliveryBackend, NullSandbox,
    PolicyEvaluator, Recorder, RunStore, RuntimeEngine, StartRunRequest, StoreContextAdapter,
};
use conductor_types::{
    subjects, AgentProfile, AgentState, BusMessage, DeliverMode, EngineEvent, HeartbeatPayload,
    PolicyProfile, ProjectRecord, QualityGatePolicy, QualityGateResult, RetrievalHit, Run,
    RunCompletePayload, RunStatus, TaskRecord, TaskState, TerminationPolicy, ToolCallRequest,
    ToolCallResult,
};

struct NoRetrieval;

#[async_trait]
impl RetrievalClient for NoRetrieval {
    async fn search(
        &self,
        _project_id: &str,
        _query: &str,
        _top_k: u32,
    ) -> anyhow::Result<Vec<RetrievalHit>> {
        Ok(Vec::new())
    }

    async fn subagent_search(
        &self,
        _project_id: &str,
        _query: &str,
        _top_k: u32,
    ) -> anyhow::Result<Vec<RetrievalHit>> {
        Ok(Vec::new())
    }

    async fn graph_search(
        &self,
        _project_id: &str,
        _seeds: &[String],
        _max_hops: u32,
        _top_k: u32,
    ) -> anyhow::Result<Vec<RetrievalHit>> {
        Ok(Vec::new())
    }
}

struct Harness {
    engine: RuntimeEngine,
    store: Arc<MemoryStore>,
    bus: Arc<BroadcastBus>,
    events: EventBus,
    policies: Arc<PolicyEvaluator>,
    workspace: tempfile::TempDir,
    _shadow: tempfile::TempDir,
}

async fn harness() -> Harness {
    harness_with(EngineConfig {
        sub_agent_timeout: 0,
        ..EngineConfig::default()
    })
    .await
}

async fn harness_with(config: EngineConfig) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let workspace = tempfile::tempdir().unwrap();
    let shadow = tempfile::tempdir().unwrap();

    store
        .put_project(ProjectRecord {
            id: "p-1".into(),
            name: "demo".into(),
            workspace_path: workspace.path().display().to_string(),
        })
        .await;
    store
        .put_task(TaskRecord {
            id: "t-1".into(),
            project_id: "p-1".into(),
            title: "Fix the parser".into(),
            prompt: "fix the parser config handling".into(),
            status: TaskState::Open,
            result: None,
        })
        .await;
    store
        .put_agent(AgentProfile {
            id: "a-1".into(),
            name: "coder-1".into(),
            default_mode: None,
            status: AgentState::Idle,
            resources: None,
        })
        .await;

    let bus = Arc::new(BroadcastBus::new());
    let events = EventBus::new();
    let policies = Arc::new(PolicyEvaluator::new());
    let store_dyn: Arc<dyn RunStore> = store.clone();
    let delivery = Arc::new(DeliveryCoordinator::new(
        Arc::new(NullDeliveryBackend),
        Recorder::new(store_dyn.clone()),
        events.clone(),
    ));
    let context = Arc::new(ContextPackBuilder::new(
        Arc::new(StoreContextAdapter(store_dyn.clone())),
        Arc::new(NoRetrieval),
        config.context_config(),
    ));
    let engine = RuntimeEngine::new(
        store_dyn,
        bus.clone(),
        events.clone(),
        policies.clone(),
        Arc::new(CheckpointManager::new(shadow.path())),
        Arc::new(NullSandbox),
        delivery,
        context,
        config,
    );

    Harness {
        engine,
        store,
        bus,
        events,
        policies,
        workspace,
        _shadow: shadow,
    }
}

fn start_req(profile: &str) -> StartRunRequest {
    StartRunRequest {
        task_id: "t-1".into(),
        agent_id: "a-1".into(),
        policy_profile: Some(profile.into()),
        ..StartRunRequest::default()
    }
}

fn tool_request(run_id: &str, call_id: &str, tool: &str) -> ToolCallRequest {
    ToolCallRequest {
        run_id: run_id.into(),
        call_id: call_id.into(),
        tool: tool.into(),
        command: None,
        path: None,
    }
}

fn tool_result(run_id: &str, call_id: &str, tool: &str, output: &str, cost: f64) -> ToolCallResult {
    ToolCallResult {
        run_id: run_id.into(),
        call_id: call_id.into(),
        tool: tool.into(),
        success: true,
        output: output.into(),
        model: Some("gpt-test".into()),
        tokens_in: 10,
        tokens_out: 20,
        cost_usd: cost,
    }
}

fn drain_bus(rx: &mut Receiver<BusMessage>) -> Vec<BusMessage> {
    let mut out = Vec::new();
    while let Ok(message) = rx.try_recv() {
        out.push(message);
    }
    out
}

fn drain_events(rx: &mut Receiver<EngineEvent>) -> Vec<EngineEvent> {
    let mut out = Vec::new();
    while let Ok(event) = rx.try_recv() {
        out.push(event);
    }
    out
}

async fn current_run(harness: &Harness, run_id: &str) -> Run {
    harness.store.get_run(run_id).await.unwrap().unwrap()
}

#[tokio::test]
async fn happy_path_through_gate_and_delivery() {
    let harness = harness().await;
    let mut bus_rx = harness.bus.subscribe();
    let mut event_rx = harness.events.subscribe();

    let mut req = start_req("headless-safe-sandbox");
    req.deliver_mode = Some(DeliverMode::Patch);
    let run = harness.engine.start_run(req).await.unwrap();
    assert_eq!(run.status, RunStatus::Running);

    let mut call = tool_request(&run.id, "c-1", "Read");
    call.path = Some("src/main.go".into());
    harness.engine.handle_tool_call_request(call).await;
    harness
        .engine
        .handle_tool_call_result(tool_result(&run.id, "c-1", "Read", "package main", 0.001))
        .await;

    harness
        .engine
        .handle_run_complete(RunCompletePayload {
            run_id: run.id.clone(),
            status: Some(RunStatus::Completed),
            cost_usd: Some(0.001),
            ..RunCompletePayload::default()
        })
        .await;

    // The gate round-trip is pending; the run parks in quality_gate.
    assert_eq!(
        current_run(&harness, &run.id).await.status,
        RunStatus::QualityGate
    );

    harness
        .engine
        .handle_quality_gate_result(QualityGateResult {
            run_id: run.id.clone(),
            tests_passed: Some(true),
            lint_passed: Some(true),
            error: None,
        })
        .await;

    let terminal = current_run(&harness, &run.id).await;
    assert_eq!(terminal.status, RunStatus::Completed);
    assert_eq!(terminal.step_count, 1);
    assert!((terminal.cost_usd - 0.001).abs() < 1e-9);
    assert!(terminal.completed_at.is_some());

    let messages = drain_bus(&mut bus_rx);
    assert_eq!(messages[0].subject, subjects::RUN_START);
    let responses: Vec<&BusMessage> = messages
        .iter()
        .filter(|m| m.subject == subjects::TOOL_CALL_RESPONSE)
        .collect();
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].payload["decision"], "allow");
    let gate_requests: Vec<&BusMessage> = messages
        .iter()
        .filter(|m| m.subject == subjects::QUALITY_GATE_REQUEST)
        .collect();
    assert_eq!(gate_requests.len(), 1);
    assert_eq!(gate_requests[0].payload["run_tests"], true);
    assert_eq!(gate_requests[0].payload["run_lint"], true);

    let events = drain_events(&mut event_rx);
    let statuses: Vec<&str> = events
        .iter()
        .filter(|e| e.event_type == "run.status")
        .map(|e| e.properties["status"].as_str().unwrap())
        .collect();
    assert_eq!(statuses, vec!["running", "quality_gate", "completed"]);
    assert!(events
        .iter()
        .any(|e| e.event_type == "agui.run_finished"
            && e.properties["status"] == "completed"));
    let delivery_statuses: Vec<&str> = events
        .iter()
        .filter(|e| e.event_type == "delivery")
        .map(|e| e.properties["status"].as_str().unwrap())
        .collect();
    assert_eq!(delivery_statuses, vec!["started", "completed"]);

    assert_eq!(
        harness.store.get_task("t-1").await.unwrap().unwrap().status,
        TaskState::Completed
    );
    assert_eq!(
        harness.store.get_agent("a-1").await.unwrap().unwrap().status,
        AgentState::Idle
    );
}

#[tokio::test]
async fn policy_deny_leaves_run_running() {
    let harness = harness().await;
    let run = harness
        .engine
        .start_run(start_req("plan-readonly"))
        .await
        .unwrap();
    let mut bus_rx = harness.bus.subscribe();

    harness
        .engine
        .handle_tool_call_request(tool_request(&run.id, "c-1", "Edit"))
        .await;

    let messages = drain_bus(&mut bus_rx);
    let response = messages
        .iter()
        .find(|m| m.subject == subjects::TOOL_CALL_RESPONSE)
        .unwrap();
    assert_eq!(response.payload["decision"], "deny");

    assert_eq!(current_run(&harness, &run.id).await.status, RunStatus::Running);
    let audit = harness.store.list_audit(&run.id).await.unwrap();
    assert!(audit.iter().any(|entry| entry.action == "policy.denied"));
}

#[tokio::test]
async fn stall_fires_on_fifth_identical_read() {
    let harness = harness().await;
    let run = harness
        .engine
        .start_run(start_req("headless-safe-sandbox"))
        .await
        .unwrap();

    for step in 0..5 {
        let call_id = format!("c-{step}");
        harness
            .engine
            .handle_tool_call_result(tool_result(&run.id, &call_id, "Read", "same output", 0.001))
            .await;
        if step < 4 {
            assert_eq!(
                current_run(&harness, &run.id).await.status,
                RunStatus::Running,
                "must not stall before the fifth no-progress step"
            );
        }
    }

    let terminal = current_run(&harness, &run.id).await;
    assert_eq!(terminal.status, RunStatus::Failed);
    assert_eq!(
        terminal.error.as_deref(),
        Some("stall detected: agent not making progress")
    );
    assert_eq!(
        harness.store.get_task("t-1").await.unwrap().unwrap().status,
        TaskState::Failed
    );
    assert_eq!(
        harness.store.get_agent("a-1").await.unwrap().unwrap().status,
        AgentState::Idle
    );

    let events = harness.store.list_events(&run.id).await.unwrap();
    assert!(events.iter().any(|e| e.event_type == "stall_detected"));
}

#[tokio::test]
async fn budget_burst_times_out_after_execution() {
    let harness = harness().await;
    let run = harness
        .engine
        .start_run(start_req("headless-safe-sandbox"))
        .await
        .unwrap();
    let mut event_rx = harness.events.subscribe();
    let mut bus_rx = harness.bus.subscribe();

    harness
        .engine
        .handle_tool_call_result(tool_result(&run.id, "c-1", "Edit", "patched a file", 4.9))
        .await;
    assert_eq!(current_run(&harness, &run.id).await.status, RunStatus::Running);

    harness
        .engine
        .handle_tool_call_result(tool_result(&run.id, "c-2", "Edit", "patched another", 0.2))
        .await;

    let terminal = current_run(&harness, &run.id).await;
    assert_eq!(terminal.status, RunStatus::Timeout);
    assert_eq!(
        terminal.error.as_deref(),
        Some("budget exceeded after tool execution ($5.10/$5.00)")
    );

    // One alert per threshold for the whole run.
    let events = drain_events(&mut event_rx);
    let alerts: Vec<u64> = events
        .iter()
        .filter(|e| e.event_type == "budget_alert")
        .map(|e| e.properties["threshold"].as_u64().unwrap())
        .collect();
    assert_eq!(alerts, vec![80, 90]);

    let audit = harness.store.list_audit(&run.id).await.unwrap();
    assert!(audit.iter().any(|entry| entry.action == "budget.exceeded"));

    // No further allow responses after the terminal transition.
    harness
        .engine
        .handle_tool_call_request(tool_request(&run.id, "c-3", "Read"))
        .await;
    let messages = drain_bus(&mut bus_rx);
    let response = messages
        .iter()
        .find(|m| m.subject == subjects::TOOL_CALL_RESPONSE)
        .unwrap();
    assert_eq!(response.payload["decision"], "deny");
}

#[tokio::test]
async fn gate_failure_rolls_back_to_first_checkpoint() {
    let harness = harness().await;
    let target = harness.workspace.path().join("main.go");
    std::fs::write(&target, "original contents").unwrap();

    let run = harness
        .engine
        .start_run(start_req("headless-safe-sandbox"))
        .await
        .unwrap();

    let mut call = tool_request(&run.id, "c-1", "Edit");
    call.path = Some("main.go".into());
    harness.engine.handle_tool_call_request(call).await;
    std::fs::write(&target, "worker broke this file").unwrap();

    harness
        .engine
        .handle_run_complete(RunCompletePayload {
            run_id: run.id.clone(),
            status: Some(RunStatus::Completed),
            output: Some("done".into()),
            ..RunCompletePayload::default()
        })
        .await;
    harness
        .engine
        .handle_quality_gate_result(QualityGateResult {
            run_id: run.id.clone(),
            tests_passed: Some(false),
            lint_passed: Some(true),
            error: None,
        })
        .await;

    let terminal = current_run(&harness, &run.id).await;
    assert_eq!(terminal.status, RunStatus::Failed);
    assert_eq!(
        terminal.error.as_deref(),
        Some("quality gate failed (rollback)")
    );
    assert_eq!(
        std::fs::read_to_string(&target).unwrap(),
        "original contents"
    );

    let audit = harness.store.list_audit(&run.id).await.unwrap();
    assert!(audit.iter().any(|entry| entry.action == "qualitygate.failed"));
}

#[tokio::test]
async fn gate_failure_without_rollback_completes_with_record() {
    let harness = harness().await;
    harness.policies.register(PolicyProfile {
        name: "gated-no-rollback".into(),
        rules: Vec::new(),
        default_decision: conductor_types::PolicyDecision::Allow,
        termination: TerminationPolicy::default(),
        quality_gate: QualityGatePolicy {
            require_tests_pass: true,
            require_lint_pass: false,
            rollback_on_gate_fail: false,
        },
        resources: Default::default(),
    });

    let run = harness
        .engine
        .start_run(start_req("gated-no-rollback"))
        .await
        .unwrap();
    harness
        .engine
        .handle_run_complete(RunCompletePayload {
            run_id: run.id.clone(),
            status: Some(RunStatus::Completed),
            output: Some("done".into()),
            ..RunCompletePayload::default()
        })
        .await;
    harness
        .engine
        .handle_quality_gate_result(QualityGateResult {
            run_id: run.id.clone(),
            tests_passed: Some(false),
            lint_passed: None,
            error: None,
        })
        .await;

    let terminal = current_run(&harness, &run.id).await;
    assert_eq!(terminal.status, RunStatus::Completed);
    let events = harness.store.list_events(&run.id).await.unwrap();
    assert!(events.iter().any(|e| e.event_type == "quality_gate.failed"));
}

#[tokio::test(start_paused = true)]
async fn hitl_denies_on_approval_timeout() {
    let harness = harness().await;
    let run = harness
        .engine
        .start_run(start_req("headless-safe-sandbox"))
        .await
        .unwrap();
    let mut bus_rx = harness.bus.subscribe();
    let mut event_rx = harness.events.subscribe();

    let mut call = tool_request(&run.id, "c-1", "Bash");
    call.command = Some("git push origin main".into());
    harness.engine.handle_tool_call_request(call).await;

    let messages = drain_bus(&mut bus_rx);
    let response = messages
        .iter()
        .find(|m| m.subject == subjects::TOOL_CALL_RESPONSE)
        .unwrap();
    assert_eq!(response.payload["decision"], "deny");
    assert_eq!(response.payload["reason"], "approval timed out");

    let events = drain_events(&mut event_rx);
    assert!(events
        .iter()
        .any(|e| e.event_type == "agui.permission_request"));

    assert_eq!(current_run(&harness, &run.id).await.status, RunStatus::Running);
    let store_events = harness.store.list_events(&run.id).await.unwrap();
    assert!(store_events.iter().any(|e| e.event_type == "tool_call.denied"));
}

#[tokio::test]
async fn hitl_approval_resolves_exactly_once() {
    let harness = harness().await;
    let run = harness
        .engine
        .start_run(start_req("headless-safe-sandbox"))
        .await
        .unwrap();
    let mut bus_rx = harness.bus.subscribe();

    let engine = harness.engine.clone();
    let run_id = run.id.clone();
    let pending = tokio::spawn(async move {
        let mut call = tool_request(&run_id, "c-1", "Bash");
        call.command = Some("git push origin main".into());
        engine.handle_tool_call_request(call).await;
    });

    let mut resolved = false;
    for _ in 0..200 {
        if harness.engine.resolve_approval(&run.id, "c-1", "allow").await {
            resolved = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(resolved, "approval was never registered");
    pending.await.unwrap();

    // A second resolution is a no-op.
    assert!(!harness.engine.resolve_approval(&run.id, "c-1", "allow").await);
    assert!(!harness.engine.resolve_approval(&run.id, "c-1", "bogus").await);

    let messages = drain_bus(&mut bus_rx);
    let response = messages
        .iter()
        .find(|m| m.subject == subjects::TOOL_CALL_RESPONSE)
        .unwrap();
    assert_eq!(response.payload["decision"], "allow");
    assert_eq!(response.payload["reason"], "approved by operator");
}

#[tokio::test]
async fn max_steps_fires_at_the_boundary() {
    let harness = harness().await;
    harness.policies.register(PolicyProfile {
        name: "two-steps".into(),
        rules: Vec::new(),
        default_decision: conductor_types::PolicyDecision::Allow,
        termination: TerminationPolicy {
            max_steps: 2,
            max_cost: 0.0,
            timeout_seconds: 0,
            stall_detection: false,
            ..TerminationPolicy::default()
        },
        quality_gate: QualityGatePolicy::default(),
        resources: Default::default(),
    });
    let run = harness.engine.start_run(start_req("two-steps")).await.unwrap();
    let mut bus_rx = harness.bus.subscribe();

    harness
        .engine
        .handle_tool_call_request(tool_request(&run.id, "c-1", "Read"))
        .await;
    harness
        .engine
        .handle_tool_call_request(tool_request(&run.id, "c-2", "Read"))
        .await;
    assert_eq!(current_run(&harness, &run.id).await.status, RunStatus::Running);

    harness
        .engine
        .handle_tool_call_request(tool_request(&run.id, "c-3", "Read"))
        .await;
    let terminal = current_run(&harness, &run.id).await;
    assert_eq!(terminal.status, RunStatus::Timeout);
    assert_eq!(terminal.error.as_deref(), Some("max steps reached (2/2)"));

    let messages = drain_bus(&mut bus_rx);
    let decisions: Vec<&str> = messages
        .iter()
        .filter(|m| m.subject == subjects::TOOL_CALL_RESPONSE)
        .map(|m| m.payload["decision"].as_str().unwrap())
        .collect();
    assert_eq!(decisions, vec!["allow", "allow", "deny"]);
}

#[tokio::test]
async fn stale_heartbeat_terminates_on_request_path() {
    let harness = harness_with(EngineConfig {
        sub_agent_timeout: 0,
        heartbeat_timeout: 60,
        ..EngineConfig::default()
    })
    .await;
    let run = harness
        .engine
        .start_run(start_req("headless-safe-sandbox"))
        .await
        .unwrap();

    harness
        .engine
        .handle_heartbeat(HeartbeatPayload {
            run_id: run.id.clone(),
            timestamp: Utc::now() - chrono::Duration::seconds(120),
        })
        .await;
    harness
        .engine
        .handle_tool_call_request(tool_request(&run.id, "c-1", "Read"))
        .await;

    let terminal = current_run(&harness, &run.id).await;
    assert_eq!(terminal.status, RunStatus::Timeout);
    assert_eq!(terminal.error.as_deref(), Some("heartbeat stale"));
}

#[tokio::test(start_paused = true)]
async fn timeout_supervisor_cancels_overdue_run() {
    let harness = harness().await;
    harness.policies.register(PolicyProfile {
        name: "one-second".into(),
        rules: Vec::new(),
        default_decision: conductor_types::PolicyDecision::Allow,
        termination: TerminationPolicy {
            max_steps: 0,
            max_cost: 0.0,
            timeout_seconds: 1,
            stall_detection: false,
            ..TerminationPolicy::default()
        },
        quality_gate: QualityGatePolicy::default(),
        resources: Default::default(),
    });
    let run = harness.engine.start_run(start_req("one-second")).await.unwrap();

    let mut status = RunStatus::Running;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        status = current_run(&harness, &run.id).await.status;
        if status == RunStatus::Timeout {
            break;
        }
    }
    assert_eq!(status, RunStatus::Timeout);
    assert_eq!(
        current_run(&harness, &run.id).await.error.as_deref(),
        Some("context-level timeout")
    );
}

#[tokio::test]
async fn cancel_run_is_active_only() {
    let harness = harness().await;
    let run = harness
        .engine
        .start_run(start_req("headless-safe-sandbox"))
        .await
        .unwrap();
    let mut bus_rx = harness.bus.subscribe();

    harness.engine.cancel_run(&run.id).await.unwrap();
    let terminal = current_run(&harness, &run.id).await;
    assert_eq!(terminal.status, RunStatus::Cancelled);
    assert_eq!(terminal.error.as_deref(), Some("cancelled by user"));
    assert_eq!(
        harness.store.get_task("t-1").await.unwrap().unwrap().status,
        TaskState::Cancelled
    );

    let messages = drain_bus(&mut bus_rx);
    assert!(messages.iter().any(|m| m.subject == subjects::RUN_CANCEL));
    let audit = harness.store.list_audit(&run.id).await.unwrap();
    assert!(audit.iter().any(|entry| entry.action == "run.cancelled"));

    let again = harness.engine.cancel_run(&run.id).await;
    assert!(matches!(again, Err(EngineError::Inactive(_))));

    let missing = harness.engine.cancel_run("no-such-run").await;
    assert!(matches!(missing, Err(EngineError::NotFound { .. })));
}

#[tokio::test]
async fn terminal_runs_never_mutate() {
    let harness = harness().await;
    let run = harness
        .engine
        .start_run(start_req("headless-safe-sandbox"))
        .await
        .unwrap();
    harness.engine.cancel_run(&run.id).await.unwrap();

    let before = current_run(&harness, &run.id).await;
    harness
        .engine
        .handle_tool_call_result(tool_result(&run.id, "c-9", "Edit", "late result", 1.0))
        .await;
    harness
        .engine
        .handle_run_complete(RunCompletePayload {
            run_id: run.id.clone(),
            status: Some(RunStatus::Completed),
            ..RunCompletePayload::default()
        })
        .await;

    let after = current_run(&harness, &run.id).await;
    assert_eq!(after.status, RunStatus::Cancelled);
    assert!((after.cost_usd - before.cost_usd).abs() < 1e-9);
    assert_eq!(after.step_count, before.step_count);
}

#[tokio::test]
async fn completion_callback_fires_once_per_run() {
    let harness = harness().await;
    let seen: Arc<Mutex<Vec<(String, RunStatus)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    harness
        .engine
        .set_on_run_complete(move |run_id, status| {
            sink.lock().unwrap().push((run_id, status));
        })
        .await;

    let run = harness.engine.start_run(start_req("standard")).await.unwrap();
    harness
        .engine
        .handle_run_complete(RunCompletePayload {
            run_id: run.id.clone(),
            status: Some(RunStatus::Completed),
            output: Some("all done".into()),
            ..RunCompletePayload::default()
        })
        .await;

    let calls = seen.lock().unwrap().clone();
    assert_eq!(calls, vec![(run.id.clone(), RunStatus::Completed)]);
}

#[tokio::test]
async fn artifact_validation_downgrades_completion() {
    let harness = harness().await;
    let mut req = start_req("standard");
    req.mode_id = Some("plan".into());
    let run = harness.engine.start_run(req).await.unwrap();
    assert_eq!(run.required_artifact.as_deref(), Some("markdown"));

    harness
        .engine
        .handle_run_complete(RunCompletePayload {
            run_id: run.id.clone(),
            status: Some(RunStatus::Completed),
            output: None,
            ..RunCompletePayload::default()
        })
        .await;

    let terminal = current_run(&harness, &run.id).await;
    assert_eq!(terminal.status, RunStatus::Failed);
    assert_eq!(terminal.artifact_valid, Some(false));
    assert_eq!(terminal.artifact_errors, vec!["output is empty".to_string()]);
    let audit = harness.store.list_audit(&run.id).await.unwrap();
    assert!(audit.iter().any(|entry| entry.action == "artifact.failed"));
}

#[tokio::test]
async fn start_run_validates_before_any_state_change() {
    let harness = harness().await;

    let empty = harness
        .engine
        .start_run(StartRunRequest {
            agent_id: "a-1".into(),
            ..StartRunRequest::default()
        })
        .await;
    assert!(matches!(empty, Err(EngineError::Validation(_))));

    let ghost_agent = harness
        .engine
        .start_run(StartRunRequest {
            task_id: "t-1".into(),
            agent_id: "ghost".into(),
            ..StartRunRequest::default()
        })
        .await;
    assert!(matches!(
        ghost_agent,
        Err(EngineError::NotFound { kind: "agent", .. })
    ));

    let bad_profile = harness.engine.start_run(start_req("no-such-profile")).await;
    match bad_profile {
        Err(EngineError::Validation(message)) => {
            assert!(message.contains("unknown policy profile"));
        }
        other => panic!("expected validation error, got {other:?}"),
    }

    // No state change happened on any failed start.
    assert_eq!(
        harness.store.get_task("t-1").await.unwrap().unwrap().status,
        TaskState::Open
    );
    assert_eq!(
        harness.store.get_agent("a-1").await.unwrap().unwrap().status,
        AgentState::Idle
    );
}

#[tokio::test]
async fn conversation_tool_calls_use_simplified_policy() {
    let harness = harness().await;
    harness
        .store
        .put_conversation(conductor_types::ConversationRecord {
            id: "conv-1".into(),
            policy_profile: None,
        })
        .await;
    harness
        .store
        .put_conversation(conductor_types::ConversationRecord {
            id: "conv-2".into(),
            policy_profile: Some("plan-readonly".into()),
        })
        .await;
    let mut bus_rx = harness.bus.subscribe();

    harness
        .engine
        .handle_tool_call_request(tool_request("conv-1", "c-1", "Edit"))
        .await;
    harness
        .engine
        .handle_tool_call_request(tool_request("conv-2", "c-2", "Edit"))
        .await;
    harness
        .engine
        .handle_tool_call_request(tool_request("stale-run", "c-3", "Read"))
        .await;

    let messages = drain_bus(&mut bus_rx);
    let decisions: Vec<(&str, &str)> = messages
        .iter()
        .filter(|m| m.subject == subjects::TOOL_CALL_RESPONSE)
        .map(|m| {
            (
                m.payload["call_id"].as_str().unwrap(),
                m.payload["decision"].as_str().unwrap(),
            )
        })
        .collect();
    assert_eq!(
        decisions,
        vec![("c-1", "allow"), ("c-2", "deny"), ("c-3", "deny")]
    );
}

#[tokio::test]
async fn subscribers_dispatch_worker_messages() {
    let harness = harness().await;
    let run = harness
        .engine
        .start_run(start_req("headless-safe-sandbox"))
        .await
        .unwrap();

    let bus_dyn: Arc<dyn MessageBus> = harness.bus.clone();
    BusSubscribers::new(harness.engine.clone(), None).spawn(bus_dyn.clone());
    let mut bus_rx = harness.bus.subscribe();

    bus_dyn
        .publish(
            subjects::TOOL_CALL_REQUEST,
            serde_json::json!({
                "run_id": run.id,
                "call_id": "c-1",
                "tool": "Read",
                "path": "src/lib.rs",
            }),
        )
        .unwrap();

    let response = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let message = bus_rx.recv().await.unwrap();
            if message.subject == subjects::TOOL_CALL_RESPONSE {
                return message;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(response.payload["decision"], "allow");
    assert_eq!(response.payload["call_id"], "c-1");
    assert_eq!(current_run(&harness, &run.id).await.step_count, 1);
}
