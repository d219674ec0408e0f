use serde::{Deserialize, Serialize};

use crate::ResourceLimits;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyDecision {
    Allow,
    Deny,
    Ask,
}

impl PolicyDecision {
    pub fn as_str(self) -> &'static str {
        match self {
            PolicyDecision::Allow => "allow",
            PolicyDecision::Deny => "deny",
            PolicyDecision::Ask => "ask",
        }
    }
}

/// One ordered rule. Any subset of the matchers may be set; a rule with no
/// matchers set matches everything.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyRule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_pattern: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path_glob: Option<String>,
    pub decision: PolicyDecision,
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminationPolicy {
    #[serde(default)]
    pub max_steps: u32,
    #[serde(default)]
    pub max_cost: f64,
    #[serde(default)]
    pub timeout_seconds: u64,
    #[serde(default)]
    pub stall_detection: bool,
    #[serde(default)]
    pub stall_threshold: u32,
    #[serde(default)]
    pub stall_max_retries: u32,
}

impl Default for TerminationPolicy {
    fn default() -> Self {
        Self {
            max_steps: 200,
            max_cost: 5.0,
            timeout_seconds: 7200,
            stall_detection: false,
            stall_threshold: 5,
            stall_max_retries: 1,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QualityGatePolicy {
    #[serde(default)]
    pub require_tests_pass: bool,
    #[serde(default)]
    pub require_lint_pass: bool,
    #[serde(default)]
    pub rollback_on_gate_fail: bool,
}

impl QualityGatePolicy {
    pub fn is_required(&self) -> bool {
        self.require_tests_pass || self.require_lint_pass
    }
}

/// Ordered decision rules plus termination ceilings and quality-gate
/// requirements. Read-only configuration once registered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyProfile {
    pub name: String,
    #[serde(default)]
    pub rules: Vec<PolicyRule>,
    pub default_decision: PolicyDecision,
    #[serde(default)]
    pub termination: TerminationPolicy,
    #[serde(default)]
    pub quality_gate: QualityGatePolicy,
    #[serde(default)]
    pub resources: ResourceLimits,
}
