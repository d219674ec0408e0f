use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    ContextEntry, DeliverMode, ExecMode, McpServerRef, PolicyDecision, RunStatus,
};

/// Bus subjects. Workers and the engine agree on these strings; payloads are
/// the structs below, always carrying `run_id` unless noted.
pub mod subjects {
    pub const RUN_START: &str = "run.start";
    pub const RUN_HEARTBEAT: &str = "run.heartbeat";
    pub const RUN_OUTPUT: &str = "run.output";
    pub const RUN_COMPLETE: &str = "run.complete";
    pub const RUN_CANCEL: &str = "run.cancel";
    pub const TOOL_CALL_REQUEST: &str = "tool_call.request";
    pub const TOOL_CALL_RESPONSE: &str = "tool_call.response";
    pub const TOOL_CALL_RESULT: &str = "tool_call.result";
    pub const QUALITY_GATE_REQUEST: &str = "quality_gate.request";
    pub const QUALITY_GATE_RESULT: &str = "quality_gate.result";
    pub const RETRIEVAL_SEARCH_REQUEST: &str = "retrieval.search.request";
    pub const RETRIEVAL_SEARCH_RESULT: &str = "retrieval.search.result";
    pub const RETRIEVAL_SUBAGENT_REQUEST: &str = "retrieval.subagent.request";
    pub const RETRIEVAL_SUBAGENT_RESULT: &str = "retrieval.subagent.result";
    pub const RETRIEVAL_GRAPH_REQUEST: &str = "retrieval.graph.request";
    pub const RETRIEVAL_GRAPH_RESULT: &str = "retrieval.graph.result";
}

/// A single message on the bus: subject plus a JSON payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusMessage {
    pub subject: String,
    pub payload: Value,
}

impl BusMessage {
    pub fn new(subject: impl Into<String>, payload: Value) -> Self {
        Self {
            subject: subject.into(),
            payload,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModeInfo {
    pub id: String,
    pub prompt_prefix: String,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub denied_tools: Vec<String>,
    #[serde(default)]
    pub denied_actions: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_artifact: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminationInfo {
    pub max_steps: u32,
    pub timeout_seconds: u64,
    pub max_cost: f64,
}

/// Everything a worker needs to execute a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStartPayload {
    pub run_id: String,
    pub task_id: String,
    pub project_id: String,
    pub agent_id: String,
    pub prompt: String,
    pub policy_profile: String,
    pub exec_mode: ExecMode,
    pub deliver_mode: DeliverMode,
    pub mode: ModeInfo,
    #[serde(default)]
    pub config: Value,
    pub termination: TerminationInfo,
    #[serde(default)]
    pub context: Vec<ContextEntry>,
    #[serde(default)]
    pub mcp_servers: Vec<McpServerRef>,
    #[serde(default)]
    pub microagent_prompts: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    pub run_id: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunOutputPayload {
    pub run_id: String,
    pub task_id: String,
    pub line: String,
    #[serde(default)]
    pub stream: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunCompletePayload {
    pub run_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<RunStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_usd: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_in: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_out: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunCancelPayload {
    pub run_id: String,
}

/// A sensitive action proposed by the worker. `call_id` is unique within
/// the run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub run_id: String,
    pub call_id: String,
    pub tool: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// Exactly one response per request. `exec_mode` and `container_id` are
/// present only for hybrid runs so the worker can route file operations to
/// the host and commands to the container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallResponse {
    pub run_id: String,
    pub call_id: String,
    pub decision: PolicyDecision,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exec_mode: Option<ExecMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallResult {
    pub run_id: String,
    pub call_id: String,
    pub tool: String,
    pub success: bool,
    #[serde(default)]
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default)]
    pub tokens_in: u64,
    #[serde(default)]
    pub tokens_out: u64,
    #[serde(default)]
    pub cost_usd: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityGateRequest {
    pub run_id: String,
    pub project_id: String,
    pub workspace_path: String,
    pub run_tests: bool,
    pub run_lint: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lint_command: Option<String>,
}

/// `tests_passed`/`lint_passed` are tri-state: `None` means the check was
/// not run and does not fail the gate.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QualityGateResult {
    pub run_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tests_passed: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lint_passed: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl QualityGateResult {
    pub fn passed(&self) -> bool {
        self.error.as_deref().map_or(true, str::is_empty)
            && self.tests_passed.unwrap_or(true)
            && self.lint_passed.unwrap_or(true)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalRequest {
    pub request_id: String,
    pub project_id: String,
    pub query: String,
    pub top_k: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bm25_weight: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub semantic_weight: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_queries: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rerank: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_hops: Option<u32>,
    #[serde(default)]
    pub seeds: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalHit {
    pub filepath: String,
    pub content: String,
    pub score: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symbol_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hops: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetrievalResult {
    pub request_id: String,
    #[serde(default)]
    pub hits: Vec<RetrievalHit>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gate_result_passes_when_checks_nil_or_true() {
        let result = QualityGateResult {
            run_id: "r-1".into(),
            tests_passed: None,
            lint_passed: Some(true),
            error: None,
        };
        assert!(result.passed());
    }

    #[test]
    fn gate_result_fails_on_error_or_false_check() {
        let failed_tests = QualityGateResult {
            run_id: "r-1".into(),
            tests_passed: Some(false),
            lint_passed: Some(true),
            error: None,
        };
        assert!(!failed_tests.passed());

        let errored = QualityGateResult {
            run_id: "r-1".into(),
            tests_passed: Some(true),
            lint_passed: Some(true),
            error: Some("worker crashed".into()),
        };
        assert!(!errored.passed());
    }

    #[test]
    fn tool_call_response_omits_routing_fields_when_absent() {
        let response = ToolCallResponse {
            run_id: "r-1".into(),
            call_id: "c-1".into(),
            decision: PolicyDecision::Allow,
            reason: String::new(),
            exec_mode: None,
            container_id: None,
        };
        let value = serde_json::to_value(&response).unwrap();
        assert!(value.get("exec_mode").is_none());
        assert!(value.get("container_id").is_none());
    }
}
