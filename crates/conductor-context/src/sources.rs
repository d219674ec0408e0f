use async_trait::async_trait;

use conductor_types::{ContextPack, RetrievalHit};

/// Synchronous-over-async retrieval against the worker plane. Implementations
/// publish on the bus and wait for a correlated response; callers only see a
/// future per query.
#[async_trait]
pub trait RetrievalClient: Send + Sync {
    async fn search(
        &self,
        project_id: &str,
        query: &str,
        top_k: u32,
    ) -> anyhow::Result<Vec<RetrievalHit>>;

    /// Multi-query sub-agent search. Falls back to `search` at the call site
    /// when disabled or failing.
    async fn subagent_search(
        &self,
        project_id: &str,
        query: &str,
        top_k: u32,
    ) -> anyhow::Result<Vec<RetrievalHit>>;

    async fn graph_search(
        &self,
        project_id: &str,
        seeds: &[String],
        max_hops: u32,
        top_k: u32,
    ) -> anyhow::Result<Vec<RetrievalHit>>;
}

/// Durable-store surface the builder needs: pack cache plus the two
/// store-backed context sources.
#[async_trait]
pub trait ContextStore: Send + Sync {
    async fn get_context_pack(&self, task_id: &str) -> anyhow::Result<Option<ContextPack>>;

    async fn put_context_pack(&self, pack: &ContextPack) -> anyhow::Result<()>;

    async fn repo_map(&self, project_id: &str) -> anyhow::Result<Option<String>>;

    async fn shared_notes(&self, team_id: &str) -> anyhow::Result<Option<String>>;
}
