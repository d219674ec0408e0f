use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::Level;
use uuid::Uuid;

use conductor_context::ContextPackBuilder;
use conductor_observability::{emit_event, ObservabilityEvent, ProcessKind};
use conductor_types::{
    subjects, AgentState, DeliverMode, EngineEvent, ExecMode, HeartbeatPayload, ModeInfo,
    PolicyDecision, PolicyProfile, QualityGateRequest, QualityGateResult, ResourceLimits, Run,
    RunCompletePayload, RunOutputPayload, RunStartPayload, RunStatus, TaskState, TerminationInfo,
    ToolCallRequest, ToolCallResponse, ToolCallResult,
};

use crate::bus::{EventBus, MessageBus};
use crate::checkpoint::CheckpointManager;
use crate::config::EngineConfig;
use crate::delivery::DeliveryCoordinator;
use crate::error::EngineError;
use crate::mode_prompt::ModePromptAssembler;
use crate::policy::PolicyEvaluator;
use crate::recorder::Recorder;
use crate::sandbox::SandboxDriver;
use crate::stall::{is_file_modifying, StallTracker};
use crate::store::RunStore;
use crate::waiters::WaiterRegistry;

pub type RunCompleteCallback = Arc<dyn Fn(String, RunStatus) + Send + Sync>;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StartRunRequest {
    pub task_id: String,
    pub agent_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_profile: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exec_mode: Option<ExecMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deliver_mode: Option<DeliverMode>,
}

/// The run lifecycle engine: the stateful arbiter between the worker plane
/// and the durable store. It owns every piece of in-memory per-run state and
/// is the only writer of run status, step count, cost and tokens.
#[derive(Clone)]
pub struct RuntimeEngine {
    store: Arc<dyn RunStore>,
    bus: Arc<dyn MessageBus>,
    events: EventBus,
    policies: Arc<PolicyEvaluator>,
    recorder: Recorder,
    checkpoints: Arc<CheckpointManager>,
    sandbox: Arc<dyn SandboxDriver>,
    delivery: Arc<DeliveryCoordinator>,
    context: Arc<ContextPackBuilder>,
    prompts: ModePromptAssembler,
    config: EngineConfig,
    shutdown: CancellationToken,
    heartbeats: Arc<RwLock<HashMap<String, DateTime<Utc>>>>,
    stall_trackers: Arc<RwLock<HashMap<String, Arc<StallTracker>>>>,
    run_timeouts: Arc<RwLock<HashMap<String, CancellationToken>>>,
    run_spans: Arc<RwLock<HashMap<String, tracing::Span>>>,
    budget_alerts: Arc<RwLock<HashSet<String>>>,
    approvals: Arc<WaiterRegistry<String>>,
    on_run_complete: Arc<RwLock<Option<RunCompleteCallback>>>,
}

impl RuntimeEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn RunStore>,
        bus: Arc<dyn MessageBus>,
        events: EventBus,
        policies: Arc<PolicyEvaluator>,
        checkpoints: Arc<CheckpointManager>,
        sandbox: Arc<dyn SandboxDriver>,
        delivery: Arc<DeliveryCoordinator>,
        context: Arc<ContextPackBuilder>,
        config: EngineConfig,
    ) -> Self {
        Self {
            recorder: Recorder::new(store.clone()),
            prompts: ModePromptAssembler::new(store.clone()),
            store,
            bus,
            events,
            policies,
            checkpoints,
            sandbox,
            delivery,
            context,
            config,
            shutdown: CancellationToken::new(),
            heartbeats: Arc::new(RwLock::new(HashMap::new())),
            stall_trackers: Arc::new(RwLock::new(HashMap::new())),
            run_timeouts: Arc::new(RwLock::new(HashMap::new())),
            run_spans: Arc::new(RwLock::new(HashMap::new())),
            budget_alerts: Arc::new(RwLock::new(HashSet::new())),
            approvals: Arc::new(WaiterRegistry::new()),
            on_run_complete: Arc::new(RwLock::new(None)),
        }
    }

    /// Root token handed to bus subscribers and HITL waits; cancelling it
    /// unwinds every engine-owned task.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Single registered completion callback, set after construction. The
    /// plan orchestrator advances on it; no engine lock is held while it
    /// runs.
    pub async fn set_on_run_complete(
        &self,
        callback: impl Fn(String, RunStatus) + Send + Sync + 'static,
    ) {
        *self.on_run_complete.write().await = Some(Arc::new(callback));
    }

    // ------------------------------------------------------------------
    // StartRun
    // ------------------------------------------------------------------

    pub async fn start_run(&self, req: StartRunRequest) -> Result<Run, EngineError> {
        if req.task_id.trim().is_empty() {
            return Err(EngineError::Validation("task_id is required".into()));
        }
        if req.agent_id.trim().is_empty() {
            return Err(EngineError::Validation("agent_id is required".into()));
        }

        let task = self
            .store
            .get_task(&req.task_id)
            .await
            .map_err(transport)?
            .ok_or_else(|| EngineError::not_found("task", &req.task_id))?;
        let agent = self
            .store
            .get_agent(&req.agent_id)
            .await
            .map_err(transport)?
            .ok_or_else(|| EngineError::not_found("agent", &req.agent_id))?;

        let project_id = req
            .project_id
            .clone()
            .unwrap_or_else(|| task.project_id.clone());
        let project = self
            .store
            .get_project(&project_id)
            .await
            .map_err(transport)?
            .ok_or_else(|| EngineError::not_found("project", &project_id))?;

        let profile_name = req
            .policy_profile
            .clone()
            .unwrap_or_else(|| self.policies.default_profile_name().to_string());
        let profile = self.policies.get_profile(&profile_name).ok_or_else(|| {
            EngineError::Validation(format!("unknown policy profile: {profile_name}"))
        })?;

        let mode_id = req
            .mode_id
            .clone()
            .or_else(|| agent.default_mode.clone())
            .unwrap_or_else(|| "coder".to_string());
        let mode = self
            .prompts
            .resolve_mode(&mode_id)
            .await
            .ok_or_else(|| EngineError::Validation(format!("unknown mode: {mode_id}")))?;

        let exec_mode = req.exec_mode.unwrap_or_default();
        let deliver_mode = req
            .deliver_mode
            .unwrap_or(self.config.default_deliver_mode);

        let mut run = Run {
            id: Uuid::new_v4().to_string(),
            task_id: task.id.clone(),
            agent_id: agent.id.clone(),
            project_id: project.id.clone(),
            team_id: req.team_id.clone(),
            mode_id: Some(mode.id.clone()),
            policy_profile: profile.name.clone(),
            exec_mode,
            deliver_mode,
            status: RunStatus::Pending,
            step_count: 0,
            cost_usd: 0.0,
            tokens_in: 0,
            tokens_out: 0,
            model: None,
            container_id: None,
            started_at: Utc::now(),
            completed_at: None,
            output: None,
            error: None,
            required_artifact: mode.required_artifact.clone(),
            artifact_valid: None,
            artifact_errors: Vec::new(),
        };

        self.store.insert_run(&run).await.map_err(transport)?;
        run.status = RunStatus::Running;
        self.store.update_run(&run).await.map_err(transport)?;
        self.store
            .set_agent_status(&agent.id, AgentState::Running)
            .await
            .map_err(transport)?;
        self.store
            .update_task_status(&task.id, TaskState::Running, None)
            .await
            .map_err(transport)?;

        if matches!(exec_mode, ExecMode::Sandbox | ExecMode::Hybrid) {
            let limits = base_limits()
                .merged(profile.resources)
                .merged(agent.resources.unwrap_or_default())
                .capped_by(profile.resources);
            match self.sandbox.create(&run.id, &limits).await {
                Ok(container_id) => {
                    if let Err(err) = self.sandbox.start(&container_id).await {
                        if let Err(remove_err) = self.sandbox.remove(&container_id).await {
                            tracing::warn!(run_id = %run.id, "container remove failed: {remove_err:#}");
                        }
                        let reason = format!("sandbox start failed: {err:#}");
                        self.finalize(run, RunStatus::Failed, Some(reason.clone()))
                            .await;
                        return Err(EngineError::Validation(reason));
                    }
                    run.container_id = Some(container_id);
                    self.store.update_run(&run).await.map_err(transport)?;
                }
                Err(err) => {
                    let reason = format!("sandbox create failed: {err:#}");
                    self.finalize(run, RunStatus::Failed, Some(reason.clone()))
                        .await;
                    return Err(EngineError::Validation(reason));
                }
            }
        }

        if profile.termination.stall_detection {
            let threshold = non_zero(profile.termination.stall_threshold, self.config.stall_threshold);
            let retries = non_zero(profile.termination.stall_max_retries, self.config.stall_max_retries);
            self.stall_trackers
                .write()
                .await
                .insert(run.id.clone(), Arc::new(StallTracker::new(threshold, retries)));
        }

        let system_prompt = self
            .prompts
            .assemble(&mode, self.config.default_prompt_budget)
            .await;
        let pack = match self
            .context
            .build(&task, Some(Path::new(&project.workspace_path)), run.team_id.as_deref())
            .await
        {
            Ok(pack) => pack,
            Err(err) => {
                tracing::warn!(run_id = %run.id, "context pack build failed: {err:#}");
                None
            }
        };
        let mcp_servers = self
            .store
            .list_mcp_servers(&project.id)
            .await
            .unwrap_or_default();
        let microagent_prompts = self
            .store
            .list_microagents(&project.id, &task.prompt)
            .await
            .unwrap_or_default();

        let payload = RunStartPayload {
            run_id: run.id.clone(),
            task_id: task.id.clone(),
            project_id: project.id.clone(),
            agent_id: agent.id.clone(),
            prompt: task.prompt.clone(),
            policy_profile: profile.name.clone(),
            exec_mode,
            deliver_mode,
            mode: ModeInfo {
                id: mode.id.clone(),
                prompt_prefix: system_prompt,
                tools: mode.tools.clone(),
                denied_tools: mode.denied_tools.clone(),
                denied_actions: mode.denied_actions.clone(),
                required_artifact: mode.required_artifact.clone(),
            },
            config: json!({
                "heartbeat_timeout": self.config.heartbeat_timeout,
                "quality_gate_timeout": self.config.quality_gate_timeout,
            }),
            termination: TerminationInfo {
                max_steps: profile.termination.max_steps,
                timeout_seconds: profile.termination.timeout_seconds,
                max_cost: profile.termination.max_cost,
            },
            context: pack.map(|p| p.entries).unwrap_or_default(),
            mcp_servers,
            microagent_prompts,
        };

        let encoded = serde_json::to_value(&payload)
            .map_err(|err| EngineError::Transport(err.to_string()))?;
        if let Err(err) = self.bus.publish(subjects::RUN_START, encoded) {
            let reason = format!("run.start publish failed: {err:#}");
            self.finalize(run, RunStatus::Failed, Some(reason.clone()))
                .await;
            return Err(EngineError::Transport(reason));
        }

        let span = tracing::info_span!("run", run_id = %run.id, agent_id = %agent.id);
        self.run_spans.write().await.insert(run.id.clone(), span);

        emit_event(
            Level::INFO,
            ProcessKind::Engine,
            ObservabilityEvent {
                event: "run.started",
                component: "engine",
                correlation_id: None,
                run_id: Some(&run.id),
                task_id: Some(&task.id),
                agent_id: Some(&agent.id),
                project_id: Some(&project.id),
                status: Some("running"),
                error_code: None,
                detail: Some(&profile.name),
            },
        );
        self.recorder
            .event(
                &run,
                "run.started",
                json!({
                    "policy_profile": profile.name,
                    "exec_mode": exec_mode,
                    "deliver_mode": deliver_mode,
                    "mode": mode.id,
                }),
            )
            .await;
        self.recorder
            .audit(&run, "run.started", format!("profile {}", profile.name))
            .await;
        self.broadcast_run_status(&run, RunStatus::Running, None);
        self.events.publish(EngineEvent::new(
            "agent.status",
            json!({"agentID": agent.id, "status": "running"}),
        ));
        self.events.publish(EngineEvent::new(
            "task.status",
            json!({"taskID": task.id, "status": "running"}),
        ));
        self.events.publish(EngineEvent::new(
            "agui.run_started",
            json!({"runID": run.id, "taskID": task.id, "agentID": agent.id}),
        ));

        if profile.termination.timeout_seconds > 0 {
            self.spawn_timeout_supervisor(&run.id, profile.termination.timeout_seconds)
                .await;
        }

        Ok(run)
    }

    /// Context-level timeout: fires once, re-reads the run so a concurrent
    /// natural completion is not double-finalized.
    async fn spawn_timeout_supervisor(&self, run_id: &str, timeout_seconds: u64) {
        let cancel = CancellationToken::new();
        self.run_timeouts
            .write()
            .await
            .insert(run_id.to_string(), cancel.clone());
        let engine = self.clone();
        let run_id = run_id.to_string();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(Duration::from_secs(timeout_seconds)) => {
                    match engine.store.get_run(&run_id).await {
                        Ok(Some(run)) if run.status == RunStatus::Running => {
                            engine
                                .finalize(run, RunStatus::Timeout, Some("context-level timeout".into()))
                                .await;
                        }
                        _ => {}
                    }
                }
            }
        });
    }

    // ------------------------------------------------------------------
    // Tool-call arbitration
    // ------------------------------------------------------------------

    pub async fn handle_tool_call_request(&self, req: ToolCallRequest) {
        let run = match self.store.get_run(&req.run_id).await {
            Ok(run) => run,
            Err(err) => {
                tracing::warn!(run_id = %req.run_id, "run lookup failed: {err:#}");
                return;
            }
        };
        let Some(mut run) = run else {
            self.handle_conversation_tool_call(req).await;
            return;
        };

        if run.status != RunStatus::Running {
            self.publish_response(
                &req.run_id,
                &req.call_id,
                PolicyDecision::Deny,
                &format!("run is not running (status {})", run.status.as_str()),
                None,
                None,
            );
            return;
        }

        let Some(profile) = self.policies.get_profile(&run.policy_profile) else {
            self.publish_response(
                &req.run_id,
                &req.call_id,
                PolicyDecision::Deny,
                &format!("unknown policy profile: {}", run.policy_profile),
                None,
                None,
            );
            return;
        };

        if let Some(reason) = self.check_termination(&run, &profile).await {
            if reason.contains("cost") {
                self.recorder.audit(&run, "budget.exceeded", reason.clone()).await;
            }
            self.finalize(run, RunStatus::Timeout, Some(reason.clone()))
                .await;
            self.publish_response(
                &req.run_id,
                &req.call_id,
                PolicyDecision::Deny,
                &reason,
                None,
                None,
            );
            return;
        }

        let verdict = self.policies.evaluate(&profile, &req);
        let (decision, reason) = match verdict.decision {
            PolicyDecision::Ask => self.await_approval(&req.run_id, &req).await,
            decided => (decided, verdict.reason.clone()),
        };

        match decision {
            PolicyDecision::Allow => {
                self.recorder
                    .event(
                        &run,
                        "tool_call.approved",
                        json!({
                            "callID": req.call_id,
                            "tool": req.tool,
                            "scope": verdict.scope,
                            "ruleIndex": verdict.rule_index,
                        }),
                    )
                    .await;
            }
            _ => {
                self.recorder
                    .event(
                        &run,
                        "tool_call.denied",
                        json!({"callID": req.call_id, "tool": req.tool, "reason": reason}),
                    )
                    .await;
                self.recorder
                    .audit(
                        &run,
                        "policy.denied",
                        format!("{} denied: {}", req.tool, reason),
                    )
                    .await;
            }
        }

        let phase = if decision == PolicyDecision::Allow {
            "approved"
        } else {
            "denied"
        };
        self.events.publish(EngineEvent::new(
            "tool_call.status",
            json!({
                "runID": run.id,
                "callID": req.call_id,
                "tool": req.tool,
                "decision": decision,
                "phase": phase,
            }),
        ));
        self.events.publish(EngineEvent::new(
            "agui.tool_call",
            json!({
                "runID": run.id,
                "callID": req.call_id,
                "tool": req.tool,
                "decision": decision,
            }),
        ));

        if decision == PolicyDecision::Allow && is_file_modifying(&req.tool) {
            if let Ok(Some(project)) = self.store.get_project(&run.project_id).await {
                self.checkpoints
                    .create(
                        &run.id,
                        &req.call_id,
                        &req.tool,
                        Path::new(&project.workspace_path),
                    )
                    .await;
            }
        }

        // Step accounting happens on the request path, before the worker
        // acknowledges the response.
        run.step_count = run.step_count.saturating_add(1);
        if let Err(err) = self.store.update_run(&run).await {
            tracing::warn!(run_id = %run.id, "step count persist failed: {err:#}");
        }

        let (exec_mode, container_id) = if run.exec_mode == ExecMode::Hybrid {
            (Some(ExecMode::Hybrid), run.container_id.clone())
        } else {
            (None, None)
        };
        self.publish_response(
            &run.id,
            &req.call_id,
            decision,
            &reason,
            exec_mode,
            container_id,
        );
    }

    /// Tool calls that reference a conversation thread instead of a run get
    /// a simplified policy path: no profile means allow, a profile that
    /// fails to resolve means deny, and `ask` still goes through HITL.
    /// Anything unknown is a stale message and is denied silently.
    async fn handle_conversation_tool_call(&self, req: ToolCallRequest) {
        let conversation = self
            .store
            .get_conversation(&req.run_id)
            .await
            .unwrap_or_else(|err| {
                tracing::warn!(id = %req.run_id, "conversation lookup failed: {err:#}");
                None
            });
        let Some(conversation) = conversation else {
            self.publish_response(
                &req.run_id,
                &req.call_id,
                PolicyDecision::Deny,
                "unknown run",
                None,
                None,
            );
            return;
        };

        let (decision, reason) = match conversation.policy_profile.as_deref() {
            None => (
                PolicyDecision::Allow,
                "no policy configured for conversation".to_string(),
            ),
            Some(name) => match self.policies.get_profile(name) {
                None => (
                    PolicyDecision::Deny,
                    format!("unknown policy profile: {name}"),
                ),
                Some(profile) => {
                    let verdict = self.policies.evaluate(&profile, &req);
                    match verdict.decision {
                        PolicyDecision::Ask => self.await_approval(&req.run_id, &req).await,
                        decided => (decided, verdict.reason),
                    }
                }
            },
        };
        self.publish_response(&req.run_id, &req.call_id, decision, &reason, None, None);
    }

    /// HITL wait: one-shot channel keyed `run_id:call_id`, permission request
    /// broadcast, deny on timeout or engine shutdown.
    async fn await_approval(&self, run_id: &str, req: &ToolCallRequest) -> (PolicyDecision, String) {
        let key = approval_key(run_id, &req.call_id);
        let mut rx = self.approvals.register(&key).await;

        self.events.publish(EngineEvent::new(
            "tool_call.status",
            json!({
                "runID": run_id,
                "callID": req.call_id,
                "tool": req.tool,
                "phase": "awaiting_approval",
            }),
        ));
        self.events.publish(EngineEvent::new(
            "agui.permission_request",
            json!({
                "runID": run_id,
                "callID": req.call_id,
                "tool": req.tool,
                "command": req.command,
                "path": req.path,
            }),
        ));

        let reply = tokio::select! {
            _ = self.shutdown.cancelled() => None,
            _ = tokio::time::sleep(self.config.approval_timeout()) => None,
            changed = rx.changed() => {
                if changed.is_ok() {
                    rx.borrow().clone()
                } else {
                    None
                }
            }
        };
        self.approvals.unregister(&key).await;

        match reply.as_deref() {
            Some("allow") => (PolicyDecision::Allow, "approved by operator".to_string()),
            Some(_) => (PolicyDecision::Deny, "denied by operator".to_string()),
            None => (PolicyDecision::Deny, "approval timed out".to_string()),
        }
    }

    /// Resolve a pending approval. Exactly one resolution wins per
    /// `(run_id, call_id)`; later calls and unknown keys return false.
    pub async fn resolve_approval(&self, run_id: &str, call_id: &str, decision: &str) -> bool {
        if decision != "allow" && decision != "deny" {
            return false;
        }
        self.approvals
            .deliver(&approval_key(run_id, call_id), decision.to_string())
            .await
    }

    /// Termination conditions, heartbeat staleness checked last.
    async fn check_termination(&self, run: &Run, profile: &PolicyProfile) -> Option<String> {
        let termination = &profile.termination;
        if termination.max_steps > 0 && run.step_count >= termination.max_steps {
            return Some(format!(
                "max steps reached ({}/{})",
                run.step_count, termination.max_steps
            ));
        }
        if termination.max_cost > 0.0 && run.cost_usd >= termination.max_cost {
            return Some(format!(
                "max cost exceeded (${:.2}/${:.2})",
                run.cost_usd, termination.max_cost
            ));
        }
        if termination.timeout_seconds > 0 {
            let elapsed = Utc::now().signed_duration_since(run.started_at);
            if elapsed.num_seconds() >= termination.timeout_seconds as i64 {
                return Some(format!(
                    "run timeout exceeded ({}s)",
                    termination.timeout_seconds
                ));
            }
        }
        if let Some(heartbeat_timeout) = self.config.heartbeat_timeout() {
            if let Some(last) = self.heartbeats.read().await.get(&run.id) {
                let stale = Utc::now().signed_duration_since(*last);
                if stale.num_seconds() >= heartbeat_timeout.as_secs() as i64 {
                    return Some("heartbeat stale".to_string());
                }
            }
        }
        None
    }

    // ------------------------------------------------------------------
    // Tool results
    // ------------------------------------------------------------------

    pub async fn handle_tool_call_result(&self, res: ToolCallResult) {
        let run = match self.store.get_run(&res.run_id).await {
            Ok(run) => run,
            Err(err) => {
                tracing::warn!(run_id = %res.run_id, "run lookup failed: {err:#}");
                return;
            }
        };
        let Some(mut run) = run else {
            // Conversation-mode result: metrics only, no state change.
            tracing::debug!(
                id = %res.run_id,
                tool = %res.tool,
                cost = res.cost_usd,
                "tool result without a run"
            );
            return;
        };
        if run.status.is_terminal() {
            return;
        }

        run.cost_usd += res.cost_usd;
        run.tokens_in = run.tokens_in.saturating_add(res.tokens_in);
        run.tokens_out = run.tokens_out.saturating_add(res.tokens_out);
        if run.model.is_none() {
            run.model = res.model.clone();
        }
        if let Err(err) = self.store.update_run(&run).await {
            tracing::warn!(run_id = %run.id, "usage persist failed: {err:#}");
        }

        let max_cost = self
            .policies
            .get_profile(&run.policy_profile)
            .map(|profile| profile.termination.max_cost)
            .unwrap_or(0.0);

        // A single expensive call can burst past the budget; catch it here
        // rather than waiting for the next request.
        if max_cost > 0.0 && run.cost_usd >= max_cost {
            let reason = format!(
                "budget exceeded after tool execution (${:.2}/${:.2})",
                run.cost_usd, max_cost
            );
            self.recorder.audit(&run, "budget.exceeded", reason.clone()).await;
            self.finalize(run, RunStatus::Timeout, Some(reason)).await;
            return;
        }

        if max_cost > 0.0 {
            for threshold in [80u32, 90] {
                if run.cost_usd < max_cost * f64::from(threshold) / 100.0 {
                    continue;
                }
                let key = format!("{}:{}", run.id, threshold);
                if self.budget_alerts.write().await.insert(key) {
                    self.events.publish(EngineEvent::new(
                        "budget_alert",
                        json!({
                            "runID": run.id,
                            "threshold": threshold,
                            "cost_usd": run.cost_usd,
                            "max_cost": max_cost,
                        }),
                    ));
                    self.recorder
                        .event(
                            &run,
                            "budget.alert",
                            json!({"threshold": threshold, "cost_usd": run.cost_usd}),
                        )
                        .await;
                }
            }
        }

        let tracker = self.stall_trackers.read().await.get(&run.id).cloned();
        if let Some(tracker) = tracker {
            if tracker.record_step(&res.tool, res.success, &res.output) {
                self.recorder
                    .event(
                        &run,
                        "stall_detected",
                        json!({"tool": res.tool, "callID": res.call_id}),
                    )
                    .await;
                self.finalize(
                    run,
                    RunStatus::Failed,
                    Some("stall detected: agent not making progress".into()),
                )
                .await;
                return;
            }
        }

        self.recorder
            .event_with_usage(
                &run,
                "tool_call.result",
                json!({"callID": res.call_id, "success": res.success}),
                Some(&res.tool),
                res.model.as_deref(),
                res.tokens_in,
                res.tokens_out,
                res.cost_usd,
            )
            .await;

        let phase = if res.success { "completed" } else { "failed" };
        self.events.publish(EngineEvent::new(
            "tool_call.status",
            json!({
                "runID": run.id,
                "callID": res.call_id,
                "tool": res.tool,
                "phase": phase,
            }),
        ));
        let mut agui = json!({"runID": run.id, "callID": res.call_id, "tool": res.tool});
        if res.success {
            agui["result"] = json!(res.output);
        } else {
            agui["error"] = json!(res.output);
        }
        self.events
            .publish(EngineEvent::new("agui.tool_result", agui));
    }

    // ------------------------------------------------------------------
    // Completion and the quality gate
    // ------------------------------------------------------------------

    pub async fn handle_run_complete(&self, payload: RunCompletePayload) {
        let run = match self.store.get_run(&payload.run_id).await {
            Ok(Some(run)) => run,
            Ok(None) => {
                tracing::warn!(run_id = %payload.run_id, "run.complete for unknown run");
                return;
            }
            Err(err) => {
                tracing::warn!(run_id = %payload.run_id, "run lookup failed: {err:#}");
                return;
            }
        };
        let mut run = run;
        if run.status != RunStatus::Running {
            tracing::debug!(run_id = %run.id, status = run.status.as_str(), "stale run.complete");
            return;
        }

        if let Some(steps) = payload.step_count {
            run.step_count = run.step_count.max(steps);
        }
        if let Some(cost) = payload.cost_usd {
            run.cost_usd = run.cost_usd.max(cost);
        }
        if let Some(tokens) = payload.tokens_in {
            run.tokens_in = run.tokens_in.max(tokens);
        }
        if let Some(tokens) = payload.tokens_out {
            run.tokens_out = run.tokens_out.max(tokens);
        }
        if payload.model.is_some() {
            run.model = payload.model.clone();
        }
        if let Some(output) = payload.output.as_deref().filter(|o| !o.is_empty()) {
            run.output = Some(output.to_string());
        }
        let error = payload.error.filter(|e| !e.is_empty());

        let mut status = payload
            .status
            .filter(|status| status.is_terminal())
            .unwrap_or(if error.is_some() {
                RunStatus::Failed
            } else {
                RunStatus::Completed
            });
        let mut final_error = error;

        if status == RunStatus::Completed {
            if let Some(kind) = run.required_artifact.clone() {
                let (valid, errors) = validate_artifact(&kind, run.output.as_deref());
                run.artifact_valid = Some(valid);
                run.artifact_errors = errors.clone();
                if let Err(err) = self.store.update_run(&run).await {
                    tracing::warn!(run_id = %run.id, "artifact validity persist failed: {err:#}");
                }
                self.events.publish(EngineEvent::new(
                    "artifact_validation",
                    json!({"runID": run.id, "valid": valid, "errors": errors}),
                ));
                if !valid {
                    self.recorder
                        .audit(&run, "artifact.failed", errors.join("; "))
                        .await;
                    self.recorder
                        .event(&run, "artifact.failed", json!({"errors": errors}))
                        .await;
                    status = RunStatus::Failed;
                    final_error = Some(format!("required {kind} artifact is invalid"));
                }
            }
        }

        let profile = self.policies.get_profile(&run.policy_profile);
        let gate = profile
            .as_ref()
            .map(|p| p.quality_gate.clone())
            .unwrap_or_default();

        if gate.is_required() && status == RunStatus::Completed {
            run.status = RunStatus::QualityGate;
            if let Err(err) = self.store.update_run(&run).await {
                tracing::warn!(run_id = %run.id, "quality_gate persist failed: {err:#}");
            }
            self.broadcast_run_status(&run, RunStatus::QualityGate, None);

            let workspace_path = self
                .store
                .get_project(&run.project_id)
                .await
                .ok()
                .flatten()
                .map(|project| project.workspace_path)
                .unwrap_or_default();
            let request = QualityGateRequest {
                run_id: run.id.clone(),
                project_id: run.project_id.clone(),
                workspace_path,
                run_tests: gate.require_tests_pass,
                run_lint: gate.require_lint_pass,
                test_command: self.config.default_test_command.clone(),
                lint_command: self.config.default_lint_command.clone(),
            };
            let encoded = match serde_json::to_value(&request) {
                Ok(encoded) => encoded,
                Err(err) => {
                    let reason = format!("quality gate dispatch failed: {err}");
                    self.recorder.audit(&run, "qualitygate.failed", reason.clone()).await;
                    self.finalize(run, RunStatus::Failed, Some(reason)).await;
                    return;
                }
            };
            // Fail-closed: a gate that cannot be dispatched never passes.
            if let Err(err) = self.bus.publish(subjects::QUALITY_GATE_REQUEST, encoded) {
                let reason = format!("quality gate dispatch failed: {err:#}");
                self.recorder.audit(&run, "qualitygate.failed", reason.clone()).await;
                self.finalize(run, RunStatus::Failed, Some(reason)).await;
                return;
            }
            self.recorder
                .event(
                    &run,
                    "quality_gate.started",
                    json!({"run_tests": gate.require_tests_pass, "run_lint": gate.require_lint_pass}),
                )
                .await;
            self.recorder
                .audit(&run, "qualitygate.started", "gate request dispatched")
                .await;
            self.events.publish(EngineEvent::new(
                "quality_gate",
                json!({"runID": run.id, "status": "started"}),
            ));
            return;
        }

        if status == RunStatus::Completed && run.deliver_mode != DeliverMode::None {
            self.trigger_delivery(&run).await;
        }
        self.finalize(run, status, final_error).await;
    }

    pub async fn handle_quality_gate_result(&self, res: QualityGateResult) {
        let run = match self.store.get_run(&res.run_id).await {
            Ok(Some(run)) => run,
            _ => {
                tracing::warn!(run_id = %res.run_id, "quality_gate.result for unknown run");
                return;
            }
        };
        if run.status != RunStatus::QualityGate {
            tracing::debug!(run_id = %run.id, "quality_gate.result outside gate phase");
            return;
        }

        if res.passed() {
            self.recorder
                .event(&run, "quality_gate.passed", json!({}))
                .await;
            self.recorder
                .audit(&run, "qualitygate.passed", "tests and lint passed")
                .await;
            self.events.publish(EngineEvent::new(
                "quality_gate",
                json!({"runID": run.id, "status": "passed"}),
            ));
            if run.deliver_mode != DeliverMode::None {
                self.trigger_delivery(&run).await;
            }
            self.finalize(run, RunStatus::Completed, None).await;
            return;
        }

        let detail = gate_failure_detail(&res);
        self.recorder
            .event(&run, "quality_gate.failed", json!({"detail": detail}))
            .await;
        self.recorder.audit(&run, "qualitygate.failed", detail.clone()).await;
        self.events.publish(EngineEvent::new(
            "quality_gate",
            json!({"runID": run.id, "status": "failed", "detail": detail}),
        ));

        let rollback = self
            .policies
            .get_profile(&run.policy_profile)
            .map(|profile| profile.quality_gate.rollback_on_gate_fail)
            .unwrap_or(false);
        if rollback {
            if let Ok(Some(project)) = self.store.get_project(&run.project_id).await {
                self.checkpoints
                    .rewind_to_first(&run.id, Path::new(&project.workspace_path))
                    .await;
            }
            self.finalize(
                run,
                RunStatus::Failed,
                Some("quality gate failed (rollback)".into()),
            )
            .await;
        } else {
            // The run keeps its output; the gate failure lives in events.
            self.finalize(run, RunStatus::Completed, None).await;
        }
    }

    // ------------------------------------------------------------------
    // Heartbeats and worker output
    // ------------------------------------------------------------------

    pub async fn handle_heartbeat(&self, payload: HeartbeatPayload) {
        self.heartbeats
            .write()
            .await
            .insert(payload.run_id, payload.timestamp);
    }

    pub async fn handle_run_output(&self, payload: RunOutputPayload) {
        self.events.publish(EngineEvent::new(
            "run.output",
            json!({
                "runID": payload.run_id,
                "taskID": payload.task_id,
                "line": payload.line,
                "stream": payload.stream,
            }),
        ));
    }

    // ------------------------------------------------------------------
    // Cancellation and finalization
    // ------------------------------------------------------------------

    pub async fn cancel_run(&self, run_id: &str) -> Result<(), EngineError> {
        let run = self
            .store
            .get_run(run_id)
            .await
            .map_err(transport)?
            .ok_or_else(|| EngineError::not_found("run", run_id))?;
        if !run.status.is_active() {
            return Err(EngineError::Inactive("run is not active".into()));
        }

        if let Err(err) = self
            .bus
            .publish(subjects::RUN_CANCEL, json!({"run_id": run_id}))
        {
            tracing::warn!(run_id, "run.cancel publish failed: {err:#}");
        }
        self.finalize(run, RunStatus::Cancelled, Some("cancelled by user".into()))
            .await;
        Ok(())
    }

    async fn trigger_delivery(&self, run: &Run) {
        let title = self
            .store
            .get_task(&run.task_id)
            .await
            .ok()
            .flatten()
            .map(|task| task.title)
            .unwrap_or_default();
        self.delivery.deliver(run, &title).await;
    }

    /// Terminal transition: cleanup, atomic persist of terminal fields, task
    /// and agent bookkeeping, best-effort checkpoint/sandbox teardown,
    /// lifecycle events, broadcasts, completion callback.
    async fn finalize(&self, mut run: Run, status: RunStatus, error: Option<String>) {
        match self.store.get_run(&run.id).await {
            Ok(Some(current)) if current.status.is_terminal() => return,
            _ => {}
        }

        self.cleanup_run_state(&run.id).await;

        run.status = status;
        if error.is_some() {
            run.error = error;
        }
        run.completed_at = Some(Utc::now());
        if let Err(err) = self.store.update_run(&run).await {
            tracing::error!(run_id = %run.id, "terminal persist failed: {err:#}");
        }

        let (task_state, task_result) = match status {
            RunStatus::Completed => (TaskState::Completed, run.output.clone()),
            RunStatus::Cancelled => (TaskState::Cancelled, run.error.clone()),
            _ => (TaskState::Failed, run.error.clone()),
        };
        if let Err(err) = self
            .store
            .update_task_status(&run.task_id, task_state, task_result)
            .await
        {
            tracing::warn!(run_id = %run.id, "task status update failed: {err:#}");
        }
        if let Err(err) = self
            .store
            .set_agent_status(&run.agent_id, AgentState::Idle)
            .await
        {
            tracing::warn!(run_id = %run.id, "agent status update failed: {err:#}");
        }

        self.checkpoints.cleanup(&run.id).await;
        if let Some(container_id) = run.container_id.clone() {
            if let Err(err) = self.sandbox.stop(&container_id).await {
                tracing::warn!(run_id = %run.id, "container stop failed: {err:#}");
            }
            if let Err(err) = self.sandbox.remove(&container_id).await {
                tracing::warn!(run_id = %run.id, "container remove failed: {err:#}");
            }
        }

        emit_event(
            if status == RunStatus::Completed {
                Level::INFO
            } else {
                Level::WARN
            },
            ProcessKind::Engine,
            ObservabilityEvent {
                event: "run.completed",
                component: "engine",
                correlation_id: None,
                run_id: Some(&run.id),
                task_id: Some(&run.task_id),
                agent_id: Some(&run.agent_id),
                project_id: Some(&run.project_id),
                status: Some(status.as_str()),
                error_code: None,
                detail: run.error.as_deref(),
            },
        );
        self.recorder
            .event(
                &run,
                "run.completed",
                json!({
                    "status": status,
                    "step_count": run.step_count,
                    "cost_usd": run.cost_usd,
                    "tokens_in": run.tokens_in,
                    "tokens_out": run.tokens_out,
                    "error": run.error,
                }),
            )
            .await;
        let audit_action = if status == RunStatus::Cancelled {
            "run.cancelled"
        } else {
            "run.completed"
        };
        self.recorder
            .audit(
                &run,
                audit_action,
                run.error
                    .clone()
                    .unwrap_or_else(|| status.as_str().to_string()),
            )
            .await;

        self.broadcast_run_status(&run, status, run.error.as_deref());
        self.events.publish(EngineEvent::new(
            "agent.status",
            json!({"agentID": run.agent_id, "status": "idle"}),
        ));
        self.events.publish(EngineEvent::new(
            "task.status",
            json!({"taskID": run.task_id, "status": task_state}),
        ));
        self.events.publish(EngineEvent::new(
            "agui.run_finished",
            json!({"runID": run.id, "status": agui_status(status)}),
        ));

        let callback = self.on_run_complete.read().await.clone();
        if let Some(callback) = callback {
            callback(run.id.clone(), status);
        }
    }

    async fn cleanup_run_state(&self, run_id: &str) {
        self.heartbeats.write().await.remove(run_id);
        self.stall_trackers.write().await.remove(run_id);
        if let Some(cancel) = self.run_timeouts.write().await.remove(run_id) {
            cancel.cancel();
        }
        self.run_spans.write().await.remove(run_id);
        let prefix = format!("{run_id}:");
        self.budget_alerts
            .write()
            .await
            .retain(|key| !key.starts_with(&prefix));
    }

    fn broadcast_run_status(&self, run: &Run, status: RunStatus, error: Option<&str>) {
        self.events.publish(EngineEvent::new(
            "run.status",
            json!({
                "runID": run.id,
                "taskID": run.task_id,
                "agentID": run.agent_id,
                "status": status,
                "error": error,
            }),
        ));
    }

    fn publish_response(
        &self,
        run_id: &str,
        call_id: &str,
        decision: PolicyDecision,
        reason: &str,
        exec_mode: Option<ExecMode>,
        container_id: Option<String>,
    ) {
        let response = ToolCallResponse {
            run_id: run_id.to_string(),
            call_id: call_id.to_string(),
            decision: if decision == PolicyDecision::Allow {
                PolicyDecision::Allow
            } else {
                PolicyDecision::Deny
            },
            reason: reason.to_string(),
            exec_mode,
            container_id,
        };
        let encoded = match serde_json::to_value(&response) {
            Ok(encoded) => encoded,
            Err(err) => {
                tracing::error!(run_id, call_id, "response encode failed: {err}");
                return;
            }
        };
        if let Err(err) = self.bus.publish(subjects::TOOL_CALL_RESPONSE, encoded) {
            tracing::warn!(run_id, call_id, "tool_call.response publish failed: {err:#}");
        }
    }
}

fn approval_key(run_id: &str, call_id: &str) -> String {
    format!("{run_id}:{call_id}")
}

fn transport(err: anyhow::Error) -> EngineError {
    EngineError::Transport(err.to_string())
}

fn non_zero(value: u32, fallback: u32) -> u32 {
    if value > 0 {
        value
    } else {
        fallback
    }
}

fn base_limits() -> ResourceLimits {
    ResourceLimits {
        cpus: Some(1.0),
        memory_mb: Some(2048),
        pids: Some(256),
    }
}

fn agui_status(status: RunStatus) -> &'static str {
    match status {
        RunStatus::Completed => "completed",
        RunStatus::Cancelled => "cancelled",
        _ => "failed",
    }
}

fn gate_failure_detail(res: &QualityGateResult) -> String {
    if let Some(error) = res.error.as_deref().filter(|e| !e.is_empty()) {
        return error.to_string();
    }
    let mut failed = Vec::new();
    if res.tests_passed == Some(false) {
        failed.push("tests");
    }
    if res.lint_passed == Some(false) {
        failed.push("lint");
    }
    if failed.is_empty() {
        "gate failed".to_string()
    } else {
        format!("{} failed", failed.join(" and "))
    }
}

/// Post-hoc artifact validation against the mode's declared artifact type.
fn validate_artifact(kind: &str, output: Option<&str>) -> (bool, Vec<String>) {
    let Some(output) = output.filter(|o| !o.trim().is_empty()) else {
        return (false, vec!["output is empty".to_string()]);
    };
    match kind.to_ascii_lowercase().as_str() {
        "json" => match serde_json::from_str::<serde_json::Value>(output) {
            Ok(_) => (true, Vec::new()),
            Err(err) => (false, vec![format!("invalid json: {err}")]),
        },
        "patch" | "diff" => {
            let looks_like_diff = output.contains("diff --git")
                || output.lines().any(|line| line.starts_with("--- "))
                || output.lines().any(|line| line.starts_with("+++ "));
            if looks_like_diff {
                (true, Vec::new())
            } else {
                (false, vec!["output is not a unified diff".to_string()])
            }
        }
        "markdown" | "md" | "text" => (true, Vec::new()),
        other => {
            tracing::warn!(artifact = other, "unknown artifact type, accepting output");
            (true, Vec::new())
        }
    }
}
