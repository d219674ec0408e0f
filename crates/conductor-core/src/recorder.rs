use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;

use conductor_types::{AgentEvent, AuditEntry, Run};

use crate::store::RunStore;

/// Append-only event and audit writer. Both streams are fire-and-forget:
/// failures are logged and never block a state transition.
#[derive(Clone)]
pub struct Recorder {
    store: Arc<dyn RunStore>,
}

impl Recorder {
    pub fn new(store: Arc<dyn RunStore>) -> Self {
        Self { store }
    }

    pub async fn event(&self, run: &Run, event_type: &str, payload: Value) {
        self.event_with_usage(run, event_type, payload, None, None, 0, 0, 0.0)
            .await;
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn event_with_usage(
        &self,
        run: &Run,
        event_type: &str,
        payload: Value,
        tool_name: Option<&str>,
        model: Option<&str>,
        tokens_in: u64,
        tokens_out: u64,
        cost_usd: f64,
    ) {
        let event = AgentEvent {
            agent_id: run.agent_id.clone(),
            task_id: run.task_id.clone(),
            project_id: run.project_id.clone(),
            run_id: run.id.clone(),
            event_type: event_type.to_string(),
            payload,
            request_id: None,
            version: 1,
            tool_name: tool_name.map(str::to_string),
            model: model.map(str::to_string),
            tokens_in,
            tokens_out,
            cost_usd,
        };
        if let Err(err) = self.store.append_event(&event).await {
            tracing::warn!(run_id = %run.id, event_type, "event append failed: {err:#}");
        }
    }

    pub async fn audit(&self, run: &Run, action: &str, details: impl Into<String>) {
        let entry = AuditEntry {
            project_id: run.project_id.clone(),
            run_id: run.id.clone(),
            agent_id: run.agent_id.clone(),
            action: action.to_string(),
            details: details.into(),
            created_at: Utc::now(),
        };
        if let Err(err) = self.store.append_audit(&entry).await {
            tracing::warn!(run_id = %run.id, action, "audit append failed: {err:#}");
        }
    }
}
