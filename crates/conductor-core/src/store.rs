use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use conductor_context::ContextStore;
use conductor_types::{
    AgentEvent, AgentProfile, AgentState, AuditEntry, ContextPack, ConversationRecord,
    McpServerRef, ModeDefinition, ProjectRecord, PromptSection, Run, TaskRecord, TaskState,
};

/// Durable-store seam. The engine is the only writer of run lifecycle
/// fields; events and audit rows are append-only.
#[async_trait]
pub trait RunStore: Send + Sync {
    async fn insert_run(&self, run: &Run) -> anyhow::Result<()>;
    async fn get_run(&self, run_id: &str) -> anyhow::Result<Option<Run>>;
    async fn update_run(&self, run: &Run) -> anyhow::Result<()>;

    async fn get_task(&self, task_id: &str) -> anyhow::Result<Option<TaskRecord>>;
    async fn update_task_status(
        &self,
        task_id: &str,
        status: TaskState,
        result: Option<String>,
    ) -> anyhow::Result<()>;

    async fn get_agent(&self, agent_id: &str) -> anyhow::Result<Option<AgentProfile>>;
    async fn set_agent_status(&self, agent_id: &str, status: AgentState) -> anyhow::Result<()>;

    async fn get_project(&self, project_id: &str) -> anyhow::Result<Option<ProjectRecord>>;
    async fn get_mode(&self, mode_id: &str) -> anyhow::Result<Option<ModeDefinition>>;
    async fn get_conversation(&self, id: &str) -> anyhow::Result<Option<ConversationRecord>>;

    async fn append_event(&self, event: &AgentEvent) -> anyhow::Result<()>;
    async fn append_audit(&self, entry: &AuditEntry) -> anyhow::Result<()>;
    async fn list_events(&self, run_id: &str) -> anyhow::Result<Vec<AgentEvent>>;
    async fn list_audit(&self, run_id: &str) -> anyhow::Result<Vec<AuditEntry>>;

    async fn get_context_pack(&self, task_id: &str) -> anyhow::Result<Option<ContextPack>>;
    async fn put_context_pack(&self, pack: &ContextPack) -> anyhow::Result<()>;
    async fn list_prompt_sections(&self, scope: &str) -> anyhow::Result<Vec<PromptSection>>;

    async fn repo_map(&self, project_id: &str) -> anyhow::Result<Option<String>>;
    async fn shared_notes(&self, team_id: &str) -> anyhow::Result<Option<String>>;
    async fn list_mcp_servers(&self, project_id: &str) -> anyhow::Result<Vec<McpServerRef>>;
    async fn list_microagents(&self, project_id: &str, prompt: &str)
        -> anyhow::Result<Vec<String>>;
}

/// Adapter exposing the narrow context-source surface of a `RunStore` to the
/// context pack builder.
pub struct StoreContextAdapter(pub Arc<dyn RunStore>);

#[async_trait]
impl ContextStore for StoreContextAdapter {
    async fn get_context_pack(&self, task_id: &str) -> anyhow::Result<Option<ContextPack>> {
        self.0.get_context_pack(task_id).await
    }

    async fn put_context_pack(&self, pack: &ContextPack) -> anyhow::Result<()> {
        self.0.put_context_pack(pack).await
    }

    async fn repo_map(&self, project_id: &str) -> anyhow::Result<Option<String>> {
        self.0.repo_map(project_id).await
    }

    async fn shared_notes(&self, team_id: &str) -> anyhow::Result<Option<String>> {
        self.0.shared_notes(team_id).await
    }
}

/// In-memory store backing tests and single-process deployments.
#[derive(Default)]
pub struct MemoryStore {
    runs: RwLock<HashMap<String, Run>>,
    tasks: RwLock<HashMap<String, TaskRecord>>,
    agents: RwLock<HashMap<String, AgentProfile>>,
    projects: RwLock<HashMap<String, ProjectRecord>>,
    modes: RwLock<HashMap<String, ModeDefinition>>,
    conversations: RwLock<HashMap<String, ConversationRecord>>,
    events: RwLock<Vec<AgentEvent>>,
    audit: RwLock<Vec<AuditEntry>>,
    packs: RwLock<HashMap<String, ContextPack>>,
    prompt_sections: RwLock<Vec<PromptSection>>,
    repo_maps: RwLock<HashMap<String, String>>,
    shared_notes: RwLock<HashMap<String, String>>,
    mcp_servers: RwLock<HashMap<String, Vec<McpServerRef>>>,
    microagents: RwLock<HashMap<String, Vec<String>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn put_task(&self, task: TaskRecord) {
        self.tasks.write().await.insert(task.id.clone(), task);
    }

    pub async fn put_agent(&self, agent: AgentProfile) {
        self.agents.write().await.insert(agent.id.clone(), agent);
    }

    pub async fn put_project(&self, project: ProjectRecord) {
        self.projects
            .write()
            .await
            .insert(project.id.clone(), project);
    }

    pub async fn put_mode(&self, mode: ModeDefinition) {
        self.modes.write().await.insert(mode.id.clone(), mode);
    }

    pub async fn put_conversation(&self, conversation: ConversationRecord) {
        self.conversations
            .write()
            .await
            .insert(conversation.id.clone(), conversation);
    }

    pub async fn put_prompt_section(&self, section: PromptSection) {
        self.prompt_sections.write().await.push(section);
    }

    pub async fn set_repo_map(&self, project_id: &str, map: &str) {
        self.repo_maps
            .write()
            .await
            .insert(project_id.to_string(), map.to_string());
    }

    pub async fn set_shared_notes(&self, team_id: &str, notes: &str) {
        self.shared_notes
            .write()
            .await
            .insert(team_id.to_string(), notes.to_string());
    }
}

#[async_trait]
impl RunStore for MemoryStore {
    async fn insert_run(&self, run: &Run) -> anyhow::Result<()> {
        self.runs.write().await.insert(run.id.clone(), run.clone());
        Ok(())
    }

    async fn get_run(&self, run_id: &str) -> anyhow::Result<Option<Run>> {
        Ok(self.runs.read().await.get(run_id).cloned())
    }

    async fn update_run(&self, run: &Run) -> anyhow::Result<()> {
        self.runs.write().await.insert(run.id.clone(), run.clone());
        Ok(())
    }

    async fn get_task(&self, task_id: &str) -> anyhow::Result<Option<TaskRecord>> {
        Ok(self.tasks.read().await.get(task_id).cloned())
    }

    async fn update_task_status(
        &self,
        task_id: &str,
        status: TaskState,
        result: Option<String>,
    ) -> anyhow::Result<()> {
        if let Some(task) = self.tasks.write().await.get_mut(task_id) {
            task.status = status;
            if result.is_some() {
                task.result = result;
            }
        }
        Ok(())
    }

    async fn get_agent(&self, agent_id: &str) -> anyhow::Result<Option<AgentProfile>> {
        Ok(self.agents.read().await.get(agent_id).cloned())
    }

    async fn set_agent_status(&self, agent_id: &str, status: AgentState) -> anyhow::Result<()> {
        if let Some(agent) = self.agents.write().await.get_mut(agent_id) {
            agent.status = status;
        }
        Ok(())
    }

    async fn get_project(&self, project_id: &str) -> anyhow::Result<Option<ProjectRecord>> {
        Ok(self.projects.read().await.get(project_id).cloned())
    }

    async fn get_mode(&self, mode_id: &str) -> anyhow::Result<Option<ModeDefinition>> {
        Ok(self.modes.read().await.get(mode_id).cloned())
    }

    async fn get_conversation(&self, id: &str) -> anyhow::Result<Option<ConversationRecord>> {
        Ok(self.conversations.read().await.get(id).cloned())
    }

    async fn append_event(&self, event: &AgentEvent) -> anyhow::Result<()> {
        self.events.write().await.push(event.clone());
        Ok(())
    }

    async fn append_audit(&self, entry: &AuditEntry) -> anyhow::Result<()> {
        self.audit.write().await.push(entry.clone());
        Ok(())
    }

    async fn list_events(&self, run_id: &str) -> anyhow::Result<Vec<AgentEvent>> {
        Ok(self
            .events
            .read()
            .await
            .iter()
            .filter(|event| event.run_id == run_id)
            .cloned()
            .collect())
    }

    async fn list_audit(&self, run_id: &str) -> anyhow::Result<Vec<AuditEntry>> {
        Ok(self
            .audit
            .read()
            .await
            .iter()
            .filter(|entry| entry.run_id == run_id)
            .cloned()
            .collect())
    }

    async fn get_context_pack(&self, task_id: &str) -> anyhow::Result<Option<ContextPack>> {
        Ok(self.packs.read().await.get(task_id).cloned())
    }

    async fn put_context_pack(&self, pack: &ContextPack) -> anyhow::Result<()> {
        self.packs
            .write()
            .await
            .insert(pack.task_id.clone(), pack.clone());
        Ok(())
    }

    async fn list_prompt_sections(&self, scope: &str) -> anyhow::Result<Vec<PromptSection>> {
        Ok(self
            .prompt_sections
            .read()
            .await
            .iter()
            .filter(|section| section.scope == scope)
            .cloned()
            .collect())
    }

    async fn repo_map(&self, project_id: &str) -> anyhow::Result<Option<String>> {
        Ok(self.repo_maps.read().await.get(project_id).cloned())
    }

    async fn shared_notes(&self, team_id: &str) -> anyhow::Result<Option<String>> {
        Ok(self.shared_notes.read().await.get(team_id).cloned())
    }

    async fn list_mcp_servers(&self, project_id: &str) -> anyhow::Result<Vec<McpServerRef>> {
        Ok(self
            .mcp_servers
            .read()
            .await
            .get(project_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn list_microagents(
        &self,
        project_id: &str,
        _prompt: &str,
    ) -> anyhow::Result<Vec<String>> {
        Ok(self
            .microagents
            .read()
            .await
            .get(project_id)
            .cloned()
            .unwrap_or_default())
    }
}
