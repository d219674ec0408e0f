use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use conductor_types::{DeliveryArtifact, EngineEvent, Run};

use crate::bus::EventBus;
use crate::recorder::Recorder;

/// Git-side packaging seam: patch file, commit, branch or pull request,
/// chosen by the run's `deliver_mode`.
#[async_trait]
pub trait DeliveryBackend: Send + Sync {
    async fn deliver(&self, run: &Run, title: &str) -> anyhow::Result<DeliveryArtifact>;
}

/// Default backend for deployments without git delivery wired up.
pub struct NullDeliveryBackend;

#[async_trait]
impl DeliveryBackend for NullDeliveryBackend {
    async fn deliver(&self, _run: &Run, _title: &str) -> anyhow::Result<DeliveryArtifact> {
        Ok(DeliveryArtifact::default())
    }
}

/// Best-effort packaging after a passing gate. Delivery trouble is recorded
/// and broadcast but never fails the run.
pub struct DeliveryCoordinator {
    backend: Arc<dyn DeliveryBackend>,
    recorder: Recorder,
    events: EventBus,
}

impl DeliveryCoordinator {
    pub fn new(backend: Arc<dyn DeliveryBackend>, recorder: Recorder, events: EventBus) -> Self {
        Self {
            backend,
            recorder,
            events,
        }
    }

    pub async fn deliver(&self, run: &Run, title: &str) {
        self.recorder
            .event(run, "delivery.started", json!({"mode": run.deliver_mode}))
            .await;
        self.events.publish(EngineEvent::new(
            "delivery",
            json!({"runID": run.id, "status": "started", "mode": run.deliver_mode}),
        ));

        match self.backend.deliver(run, title).await {
            Ok(artifact) => {
                self.recorder
                    .event(
                        run,
                        "delivery.completed",
                        json!({
                            "patch_path": artifact.patch_path,
                            "commit_hash": artifact.commit_hash,
                            "branch": artifact.branch,
                            "pr_url": artifact.pr_url,
                        }),
                    )
                    .await;
                self.recorder
                    .audit(run, "delivery.completed", format!("mode {:?}", run.deliver_mode))
                    .await;
                self.events.publish(EngineEvent::new(
                    "delivery",
                    json!({
                        "runID": run.id,
                        "status": "completed",
                        "artifact": artifact,
                    }),
                ));
            }
            Err(err) => {
                tracing::warn!(run_id = %run.id, "delivery failed: {err:#}");
                self.recorder
                    .event(run, "delivery.failed", json!({"error": err.to_string()}))
                    .await;
                self.recorder
                    .audit(run, "delivery.failed", err.to_string())
                    .await;
                self.events.publish(EngineEvent::new(
                    "delivery",
                    json!({"runID": run.id, "status": "failed", "error": err.to_string()}),
                ));
            }
        }
    }
}
