use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use conductor_context::ContextConfig;
use conductor_types::DeliverMode;

/// Engine configuration. Every field has a serde default so a config file
/// only needs the keys it overrides; `load` layers the file over defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub stall_threshold: u32,
    pub stall_max_retries: u32,
    /// Worker-side hint carried on the gate request, in seconds.
    pub quality_gate_timeout: u64,
    pub default_test_command: Option<String>,
    pub default_lint_command: Option<String>,
    /// Seconds; 0 disables heartbeat supervision.
    pub heartbeat_timeout: u64,
    pub approval_timeout_seconds: u64,
    pub default_deliver_mode: DeliverMode,
    pub default_embedding_model: Option<String>,
    pub retrieval_top_k: u32,
    pub retrieval_bm25_weight: f64,
    pub retrieval_semantic_weight: f64,
    pub sub_agent_enabled: bool,
    pub sub_agent_model: Option<String>,
    pub sub_agent_max_queries: u32,
    pub sub_agent_rerank: bool,
    /// Seconds; shared deadline for the sub-agent attempt and its fallback.
    pub sub_agent_timeout: u64,
    pub graph_enabled: bool,
    pub graph_max_hops: u32,
    pub graph_top_k: u32,
    pub default_context_budget: u32,
    pub prompt_reserve: u32,
    pub default_prompt_budget: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            stall_threshold: 5,
            stall_max_retries: 1,
            quality_gate_timeout: 600,
            default_test_command: None,
            default_lint_command: None,
            heartbeat_timeout: 0,
            approval_timeout_seconds: 60,
            default_deliver_mode: DeliverMode::None,
            default_embedding_model: None,
            retrieval_top_k: 10,
            retrieval_bm25_weight: 0.5,
            retrieval_semantic_weight: 0.5,
            sub_agent_enabled: false,
            sub_agent_model: None,
            sub_agent_max_queries: 3,
            sub_agent_rerank: false,
            sub_agent_timeout: 20,
            graph_enabled: false,
            graph_max_hops: 2,
            graph_top_k: 10,
            default_context_budget: 32_000,
            prompt_reserve: 4_000,
            default_prompt_budget: 2_000,
        }
    }
}

impl EngineConfig {
    pub async fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let raw = tokio::fs::read_to_string(path.as_ref()).await?;
        let config = serde_json::from_str(&raw)?;
        Ok(config)
    }

    pub fn approval_timeout(&self) -> Duration {
        Duration::from_secs(self.approval_timeout_seconds)
    }

    pub fn heartbeat_timeout(&self) -> Option<Duration> {
        (self.heartbeat_timeout > 0).then(|| Duration::from_secs(self.heartbeat_timeout))
    }

    pub fn context_config(&self) -> ContextConfig {
        ContextConfig {
            default_context_budget: self.default_context_budget,
            prompt_reserve: self.prompt_reserve,
            retrieval_top_k: self.retrieval_top_k,
            sub_agent_enabled: self.sub_agent_enabled,
            sub_agent_timeout: Duration::from_secs(self.sub_agent_timeout),
            graph_enabled: self.graph_enabled,
            graph_max_hops: self.graph_max_hops,
            graph_top_k: self.graph_top_k,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = EngineConfig::default();
        assert_eq!(config.stall_threshold, 5);
        assert_eq!(config.approval_timeout_seconds, 60);
        assert!(config.heartbeat_timeout().is_none());
        assert_eq!(config.default_deliver_mode, DeliverMode::None);
    }

    #[tokio::test]
    async fn load_layers_file_over_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.json");
        tokio::fs::write(
            &path,
            r#"{"stall_threshold": 8, "heartbeat_timeout": 120, "default_deliver_mode": "patch"}"#,
        )
        .await
        .unwrap();

        let config = EngineConfig::load(&path).await.unwrap();
        assert_eq!(config.stall_threshold, 8);
        assert_eq!(
            config.heartbeat_timeout(),
            Some(Duration::from_secs(120))
        );
        assert_eq!(config.default_deliver_mode, DeliverMode::Patch);
        assert_eq!(config.approval_timeout_seconds, 60);
    }
}
