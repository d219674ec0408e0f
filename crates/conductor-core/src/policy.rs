use std::collections::HashMap;
use std::sync::RwLock;

use regex::Regex;

use conductor_types::{
    PolicyDecision, PolicyProfile, PolicyRule, QualityGatePolicy, ResourceLimits,
    TerminationPolicy, ToolCallRequest,
};

pub const DEFAULT_PROFILE: &str = "standard";

/// Outcome of matching one tool call against a profile.
#[derive(Debug, Clone)]
pub struct PolicyVerdict {
    pub decision: PolicyDecision,
    pub profile: String,
    pub scope: String,
    pub rule_index: Option<usize>,
    pub reason: String,
}

/// Ordered first-match rule evaluation. Evaluation itself never fails:
/// unmatched calls fall through to the profile's default decision, and an
/// unknown profile name is the caller's error to resolve via `get_profile`.
pub struct PolicyEvaluator {
    profiles: RwLock<HashMap<String, PolicyProfile>>,
    regex_cache: RwLock<HashMap<String, Option<Regex>>>,
}

impl PolicyEvaluator {
    pub fn new() -> Self {
        let evaluator = Self {
            profiles: RwLock::new(HashMap::new()),
            regex_cache: RwLock::new(HashMap::new()),
        };
        for profile in builtin_profiles() {
            evaluator.register(profile);
        }
        evaluator
    }

    pub fn register(&self, profile: PolicyProfile) {
        if let Ok(mut profiles) = self.profiles.write() {
            profiles.insert(profile.name.clone(), profile);
        }
    }

    pub fn get_profile(&self, name: &str) -> Option<PolicyProfile> {
        self.profiles.read().ok()?.get(name).cloned()
    }

    pub fn default_profile_name(&self) -> &'static str {
        DEFAULT_PROFILE
    }

    pub fn evaluate(&self, profile: &PolicyProfile, call: &ToolCallRequest) -> PolicyVerdict {
        for (index, rule) in profile.rules.iter().enumerate() {
            if let Some(scope) = self.rule_matches(rule, call) {
                return PolicyVerdict {
                    decision: rule.decision,
                    profile: profile.name.clone(),
                    scope,
                    rule_index: Some(index),
                    reason: rule.reason.clone(),
                };
            }
        }
        PolicyVerdict {
            decision: profile.default_decision,
            profile: profile.name.clone(),
            scope: "default".to_string(),
            rule_index: None,
            reason: format!("no rule matched; profile default {}", profile.default_decision.as_str()),
        }
    }

    /// A rule matches when every matcher it sets matches; a rule with no
    /// matchers set matches everything.
    fn rule_matches(&self, rule: &PolicyRule, call: &ToolCallRequest) -> Option<String> {
        let mut scopes = Vec::new();

        if let Some(tool) = rule.tool.as_deref() {
            if !tool.eq_ignore_ascii_case(&call.tool) {
                return None;
            }
            scopes.push("tool");
        }

        if let Some(pattern) = rule.command_pattern.as_deref() {
            let command = call.command.as_deref().unwrap_or("");
            if !self.regex_matches(pattern, command) {
                return None;
            }
            scopes.push("command");
        }

        if let Some(glob) = rule.path_glob.as_deref() {
            let path = call.path.as_deref().unwrap_or("");
            if !wildcard_matches(glob, path) {
                return None;
            }
            scopes.push("path");
        }

        if scopes.is_empty() {
            scopes.push("any");
        }
        Some(scopes.join("+"))
    }

    fn regex_matches(&self, pattern: &str, value: &str) -> bool {
        if let Ok(cache) = self.regex_cache.read() {
            if let Some(compiled) = cache.get(pattern) {
                return compiled.as_ref().map(|re| re.is_match(value)).unwrap_or(false);
            }
        }
        let compiled = match Regex::new(pattern) {
            Ok(re) => Some(re),
            Err(err) => {
                tracing::warn!(pattern, "invalid command pattern in policy rule: {err}");
                None
            }
        };
        let matched = compiled.as_ref().map(|re| re.is_match(value)).unwrap_or(false);
        if let Ok(mut cache) = self.regex_cache.write() {
            cache.insert(pattern.to_string(), compiled);
        }
        matched
    }
}

impl Default for PolicyEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

pub fn wildcard_matches(pattern: &str, value: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if !pattern.contains('*') {
        return pattern == value;
    }
    let mut remaining = value;
    let mut is_first = true;
    for part in pattern.split('*') {
        if part.is_empty() {
            continue;
        }
        if is_first {
            if let Some(stripped) = remaining.strip_prefix(part) {
                remaining = stripped;
            } else {
                return false;
            }
            is_first = false;
            continue;
        }
        if let Some(index) = remaining.find(part) {
            remaining = &remaining[index + part.len()..];
        } else {
            return false;
        }
    }
    pattern.ends_with('*') || remaining.is_empty()
}

fn deny(tool: Option<&str>, command_pattern: Option<&str>, reason: &str) -> PolicyRule {
    PolicyRule {
        tool: tool.map(str::to_string),
        command_pattern: command_pattern.map(str::to_string),
        path_glob: None,
        decision: PolicyDecision::Deny,
        reason: reason.to_string(),
    }
}

fn allow_tool(tool: &str, reason: &str) -> PolicyRule {
    PolicyRule {
        tool: Some(tool.to_string()),
        command_pattern: None,
        path_glob: None,
        decision: PolicyDecision::Allow,
        reason: reason.to_string(),
    }
}

fn builtin_profiles() -> Vec<PolicyProfile> {
    let danger_rules = vec![
        deny(None, Some(r"rm\s+-[rf]{1,2}\s+/"), "recursive delete of an absolute path"),
        deny(None, Some(r"(^|\s)sudo(\s|$)"), "privilege escalation"),
        deny(None, Some(r"git\s+push\s+.*--force"), "force push"),
        PolicyRule {
            tool: None,
            command_pattern: None,
            path_glob: Some("*.env".to_string()),
            decision: PolicyDecision::Deny,
            reason: "environment files carry secrets".to_string(),
        },
    ];

    let mut sandbox_rules = danger_rules.clone();
    sandbox_rules.push(PolicyRule {
        tool: None,
        command_pattern: Some(r"git\s+push".to_string()),
        path_glob: None,
        decision: PolicyDecision::Ask,
        reason: "pushing requires approval".to_string(),
    });
    for tool in [
        "Read", "Glob", "Grep", "Edit", "Write", "Bash", "execute", "read_file", "write_file",
        "edit_file", "list_files",
    ] {
        sandbox_rules.push(allow_tool(tool, "tool permitted in sandbox"));
    }

    let mut standard_rules = danger_rules;
    standard_rules.push(PolicyRule {
        tool: None,
        command_pattern: Some(r"git\s+push".to_string()),
        path_glob: None,
        decision: PolicyDecision::Ask,
        reason: "pushing requires approval".to_string(),
    });

    vec![
        PolicyProfile {
            name: DEFAULT_PROFILE.to_string(),
            rules: standard_rules,
            default_decision: PolicyDecision::Allow,
            termination: TerminationPolicy {
                stall_detection: true,
                ..TerminationPolicy::default()
            },
            quality_gate: QualityGatePolicy::default(),
            resources: ResourceLimits::default(),
        },
        PolicyProfile {
            name: "headless-safe-sandbox".to_string(),
            rules: sandbox_rules,
            default_decision: PolicyDecision::Deny,
            termination: TerminationPolicy {
                max_steps: 200,
                max_cost: 5.0,
                timeout_seconds: 7200,
                stall_detection: true,
                stall_threshold: 5,
                stall_max_retries: 1,
            },
            quality_gate: QualityGatePolicy {
                require_tests_pass: true,
                require_lint_pass: true,
                rollback_on_gate_fail: true,
            },
            resources: ResourceLimits {
                cpus: Some(2.0),
                memory_mb: Some(4096),
                pids: Some(512),
            },
        },
        PolicyProfile {
            name: "plan-readonly".to_string(),
            rules: vec![
                allow_tool("Read", "read-only planning"),
                allow_tool("Glob", "read-only planning"),
                allow_tool("Grep", "read-only planning"),
                allow_tool("read_file", "read-only planning"),
                allow_tool("list_files", "read-only planning"),
                deny(Some("Edit"), None, "plan mode is read-only"),
                deny(Some("Write"), None, "plan mode is read-only"),
                deny(Some("Bash"), None, "plan mode is read-only"),
                deny(Some("execute"), None, "plan mode is read-only"),
                deny(Some("write_file"), None, "plan mode is read-only"),
                deny(Some("edit_file"), None, "plan mode is read-only"),
            ],
            default_decision: PolicyDecision::Deny,
            termination: TerminationPolicy {
                stall_detection: true,
                ..TerminationPolicy::default()
            },
            quality_gate: QualityGatePolicy::default(),
            resources: ResourceLimits::default(),
        },
    ]
}
