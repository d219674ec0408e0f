use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use ignore::WalkBuilder;
use tokio::sync::Mutex;
use tokio::time::timeout;

use conductor_types::{ContextEntry, ContextKind, ContextPack, RetrievalHit, TaskRecord};

use crate::keywords::extract_keywords;
use crate::score::{estimate_tokens, graph_priority, retrieval_priorities, score_documents};
use crate::sources::{ContextStore, RetrievalClient};

const MAX_WORKSPACE_FILES: usize = 50;
const MAX_FILE_BYTES: u64 = 32 * 1024;
const PROMPT_KEYWORD_SEEDS: usize = 5;

#[derive(Debug, Clone)]
pub struct ContextConfig {
    pub default_context_budget: u32,
    pub prompt_reserve: u32,
    pub retrieval_top_k: u32,
    pub sub_agent_enabled: bool,
    pub sub_agent_timeout: Duration,
    pub graph_enabled: bool,
    pub graph_max_hops: u32,
    pub graph_top_k: u32,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            default_context_budget: 32_000,
            prompt_reserve: 4_000,
            retrieval_top_k: 10,
            sub_agent_enabled: false,
            sub_agent_timeout: Duration::from_secs(20),
            graph_enabled: false,
            graph_max_hops: 2,
            graph_top_k: 10,
        }
    }
}

/// Assembles a token-budgeted bundle of workspace files, repo map, retrieval
/// hits and shared notes for a task. Builds are idempotent: the first build
/// persists the pack and later calls return the cached row.
pub struct ContextPackBuilder {
    store: Arc<dyn ContextStore>,
    retrieval: Arc<dyn RetrievalClient>,
    config: ContextConfig,
    builds: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ContextPackBuilder {
    pub fn new(
        store: Arc<dyn ContextStore>,
        retrieval: Arc<dyn RetrievalClient>,
        config: ContextConfig,
    ) -> Self {
        Self {
            store,
            retrieval,
            config,
            builds: Mutex::new(HashMap::new()),
        }
    }

    pub async fn build(
        &self,
        task: &TaskRecord,
        workspace_root: Option<&Path>,
        team_id: Option<&str>,
    ) -> anyhow::Result<Option<ContextPack>> {
        let guard = {
            let mut builds = self.builds.lock().await;
            builds
                .entry(task.id.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let _held = guard.lock().await;

        if let Some(existing) = self.store.get_context_pack(&task.id).await? {
            return Ok(Some(existing));
        }

        let available = self.available_budget();
        let keywords = extract_keywords(&task.prompt, 32);

        let (workspace, hits, repo_map, shared) = tokio::join!(
            scan_workspace(workspace_root),
            self.fetch_retrieval(&task.project_id, &task.prompt),
            self.store.repo_map(&task.project_id),
            self.fetch_shared(team_id),
        );
        let repo_map = repo_map.unwrap_or_else(|err| {
            tracing::warn!(task_id = %task.id, "repo map lookup failed: {err:#}");
            None
        });

        let graph_hits = if self.config.graph_enabled {
            let seeds = graph_seeds(&hits, &keywords);
            match self
                .retrieval
                .graph_search(
                    &task.project_id,
                    &seeds,
                    self.config.graph_max_hops,
                    self.config.graph_top_k,
                )
                .await
            {
                Ok(hits) => hits,
                Err(err) => {
                    tracing::warn!(task_id = %task.id, "graph search failed: {err:#}");
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        };

        let mut candidates = Vec::new();

        if let Some(notes) = shared {
            candidates.push(entry(ContextKind::Shared, "team/notes", notes, 90));
        }
        if let Some(map) = repo_map {
            candidates.push(entry(ContextKind::RepoMap, "repo_map", map, 85));
        }

        let priorities = retrieval_priorities(&hits.iter().map(|h| h.score).collect::<Vec<_>>());
        for (hit, priority) in hits.into_iter().zip(priorities) {
            candidates.push(entry(
                ContextKind::Retrieval,
                hit.filepath,
                hit.content,
                priority,
            ));
        }

        for hit in graph_hits {
            let priority = graph_priority(hit.hops.unwrap_or(0));
            candidates.push(entry(ContextKind::Graph, hit.filepath, hit.content, priority));
        }

        let docs: Vec<&str> = workspace.iter().map(|(_, body)| body.as_str()).collect();
        let scores = score_documents(&docs, &keywords);
        for ((path, body), score) in workspace.into_iter().zip(scores) {
            candidates.push(entry(ContextKind::File, path, body, score));
        }

        if candidates.is_empty() {
            return Ok(None);
        }

        let pack = pack_entries(&task.id, candidates, available);
        self.store.put_context_pack(&pack).await?;
        Ok(Some(pack))
    }

    fn available_budget(&self) -> u32 {
        let budget = self.config.default_context_budget;
        if budget > self.config.prompt_reserve {
            budget - self.config.prompt_reserve
        } else {
            budget / 2
        }
    }

    /// Sub-agent path first when enabled, single-shot fallback; both attempts
    /// share one deadline.
    async fn fetch_retrieval(&self, project_id: &str, prompt: &str) -> Vec<RetrievalHit> {
        let top_k = self.config.retrieval_top_k;
        let budget = self.config.sub_agent_timeout;
        let started = tokio::time::Instant::now();

        if self.config.sub_agent_enabled {
            match timeout(budget, self.retrieval.subagent_search(project_id, prompt, top_k)).await
            {
                Ok(Ok(hits)) => return hits,
                Ok(Err(err)) => {
                    tracing::warn!("sub-agent retrieval failed, falling back: {err:#}");
                }
                Err(_) => {
                    tracing::warn!("sub-agent retrieval timed out, falling back");
                }
            }
        }

        let remaining = budget.saturating_sub(started.elapsed());
        if remaining.is_zero() {
            return Vec::new();
        }
        match timeout(remaining, self.retrieval.search(project_id, prompt, top_k)).await {
            Ok(Ok(hits)) => hits,
            Ok(Err(err)) => {
                tracing::warn!("retrieval search failed: {err:#}");
                Vec::new()
            }
            Err(_) => {
                tracing::warn!("retrieval search timed out");
                Vec::new()
            }
        }
    }

    async fn fetch_shared(&self, team_id: Option<&str>) -> Option<String> {
        let team = team_id?;
        match self.store.shared_notes(team).await {
            Ok(notes) => notes,
            Err(err) => {
                tracing::warn!(team_id = %team, "shared notes fetch failed: {err:#}");
                None
            }
        }
    }
}

fn entry(kind: ContextKind, path: impl Into<String>, content: String, priority: u8) -> ContextEntry {
    let tokens = estimate_tokens(&content);
    ContextEntry {
        kind,
        path: path.into(),
        content,
        tokens,
        priority,
    }
}

/// Greedy pack by priority descending. An oversized entry is skipped rather
/// than terminating the loop, so smaller high-value entries behind it still
/// fit.
fn pack_entries(task_id: &str, mut candidates: Vec<ContextEntry>, budget: u32) -> ContextPack {
    candidates.sort_by(|a, b| b.priority.cmp(&a.priority));
    let mut entries = Vec::new();
    let mut total = 0u32;
    for candidate in candidates {
        if total + candidate.tokens > budget {
            continue;
        }
        total += candidate.tokens;
        entries.push(candidate);
    }
    ContextPack {
        task_id: task_id.to_string(),
        entries,
        total_tokens: total,
    }
}

fn graph_seeds(hits: &[RetrievalHit], keywords: &[String]) -> Vec<String> {
    let symbols: Vec<String> = hits
        .iter()
        .filter_map(|hit| hit.symbol_name.clone())
        .collect();
    if !symbols.is_empty() {
        return symbols;
    }
    keywords.iter().take(PROMPT_KEYWORD_SEEDS).cloned().collect()
}

/// Root plus one level of subdirectories, capped in count and per-file size.
async fn scan_workspace(root: Option<&Path>) -> Vec<(String, String)> {
    let Some(root) = root else {
        return Vec::new();
    };
    let root: PathBuf = root.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let mut files = Vec::new();
        for dir_entry in WalkBuilder::new(&root).max_depth(Some(2)).build().flatten() {
            if files.len() >= MAX_WORKSPACE_FILES {
                break;
            }
            if !dir_entry.file_type().map(|f| f.is_file()).unwrap_or(false) {
                continue;
            }
            let too_large = dir_entry
                .metadata()
                .map(|meta| meta.len() > MAX_FILE_BYTES)
                .unwrap_or(true);
            if too_large {
                continue;
            }
            let Ok(body) = std::fs::read_to_string(dir_entry.path()) else {
                continue;
            };
            let path = dir_entry
                .path()
                .strip_prefix(&root)
                .unwrap_or(dir_entry.path())
                .to_string_lossy()
                .to_string();
            files.push((path, body));
        }
        files
    })
    .await
    .unwrap_or_default()
}
