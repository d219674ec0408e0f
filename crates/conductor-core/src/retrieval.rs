use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use conductor_context::RetrievalClient;
use conductor_types::{
    subjects, EngineEvent, RetrievalHit, RetrievalRequest, RetrievalResult,
};

use crate::bus::{EventBus, MessageBus};
use crate::config::EngineConfig;
use crate::waiters::{correlation_id, HealthGate, WaiterRegistry};

/// Synchronous-over-async retrieval: publish a correlated request on the bus,
/// park on a single-shot waiter for the response. After a failure or timeout
/// the per-path health cooldown fast-fails callers for 30 s instead of
/// dog-piling an unhealthy retrieval worker.
pub struct BusRetrievalClient {
    bus: Arc<dyn MessageBus>,
    events: EventBus,
    waiters: Arc<WaiterRegistry<RetrievalResult>>,
    health: HealthGate,
    config: EngineConfig,
    shutdown: CancellationToken,
}

impl BusRetrievalClient {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        events: EventBus,
        config: EngineConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            bus,
            events,
            waiters: Arc::new(WaiterRegistry::new()),
            health: HealthGate::default(),
            config,
            shutdown,
        }
    }

    /// Called by the bus subscriber for every `retrieval.*.result` message.
    pub async fn deliver_result(&self, result: RetrievalResult) -> bool {
        let request_id = result.request_id.clone();
        self.waiters.deliver(&request_id, result).await
    }

    async fn round_trip(
        &self,
        path: &str,
        request_subject: &str,
        request: RetrievalRequest,
        deadline: Duration,
    ) -> anyhow::Result<Vec<RetrievalHit>> {
        if self.health.is_cooling_down(path).await {
            anyhow::bail!("{path} is cooling down after a recent failure");
        }

        let request_id = request.request_id.clone();
        self.events.publish(EngineEvent::new(
            "retrieval.status",
            json!({"path": path, "requestID": request_id, "status": "started"}),
        ));

        if let Err(err) = self
            .bus
            .publish(request_subject, serde_json::to_value(&request)?)
        {
            self.health.mark_unhealthy(path).await;
            self.broadcast_failed(path, &request_id, &err.to_string());
            return Err(err);
        }

        let outcome = self
            .waiters
            .wait(&request_id, deadline, &self.shutdown)
            .await;

        match outcome {
            Some(result) => {
                if let Some(error) = result.error.filter(|e| !e.is_empty()) {
                    self.health.mark_unhealthy(path).await;
                    self.broadcast_failed(path, &request_id, &error);
                    anyhow::bail!("{path} failed: {error}");
                }
                self.events.publish(EngineEvent::new(
                    "retrieval.status",
                    json!({
                        "path": path,
                        "requestID": request_id,
                        "status": "completed",
                        "hits": result.hits.len()
                    }),
                ));
                Ok(result.hits)
            }
            None => {
                self.health.mark_unhealthy(path).await;
                self.broadcast_failed(path, &request_id, "timed out");
                anyhow::bail!("{path} timed out after {deadline:?}")
            }
        }
    }

    fn broadcast_failed(&self, path: &str, request_id: &str, error: &str) {
        self.events.publish(EngineEvent::new(
            "retrieval.status",
            json!({"path": path, "requestID": request_id, "status": "failed", "error": error}),
        ));
    }

    fn base_request(&self, project_id: &str, query: &str, top_k: u32) -> RetrievalRequest {
        RetrievalRequest {
            request_id: correlation_id(),
            project_id: project_id.to_string(),
            query: query.to_string(),
            top_k,
            bm25_weight: Some(self.config.retrieval_bm25_weight),
            semantic_weight: Some(self.config.retrieval_semantic_weight),
            max_queries: None,
            rerank: None,
            model: self.config.default_embedding_model.clone(),
            max_hops: None,
            seeds: Vec::new(),
        }
    }
}

#[async_trait]
impl RetrievalClient for BusRetrievalClient {
    async fn search(
        &self,
        project_id: &str,
        query: &str,
        top_k: u32,
    ) -> anyhow::Result<Vec<RetrievalHit>> {
        let request = self.base_request(project_id, query, top_k);
        self.round_trip(
            "retrieval.search",
            subjects::RETRIEVAL_SEARCH_REQUEST,
            request,
            Duration::from_secs(self.config.sub_agent_timeout),
        )
        .await
    }

    async fn subagent_search(
        &self,
        project_id: &str,
        query: &str,
        top_k: u32,
    ) -> anyhow::Result<Vec<RetrievalHit>> {
        let mut request = self.base_request(project_id, query, top_k);
        request.max_queries = Some(self.config.sub_agent_max_queries);
        request.rerank = Some(self.config.sub_agent_rerank);
        if self.config.sub_agent_model.is_some() {
            request.model = self.config.sub_agent_model.clone();
        }
        self.round_trip(
            "retrieval.subagent",
            subjects::RETRIEVAL_SUBAGENT_REQUEST,
            request,
            Duration::from_secs(self.config.sub_agent_timeout),
        )
        .await
    }

    async fn graph_search(
        &self,
        project_id: &str,
        seeds: &[String],
        max_hops: u32,
        top_k: u32,
    ) -> anyhow::Result<Vec<RetrievalHit>> {
        let mut request = self.base_request(project_id, "", top_k);
        request.max_hops = Some(max_hops);
        request.seeds = seeds.to_vec();
        self.round_trip(
            "retrieval.graph",
            subjects::RETRIEVAL_GRAPH_REQUEST,
            request,
            Duration::from_secs(self.config.sub_agent_timeout),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::BroadcastBus;

    fn client(bus: Arc<BroadcastBus>) -> BusRetrievalClient {
        BusRetrievalClient::new(
            bus,
            EventBus::new(),
            EngineConfig {
                sub_agent_timeout: 1,
                ..EngineConfig::default()
            },
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn search_resolves_when_result_delivered() {
        let bus = Arc::new(BroadcastBus::new());
        let mut rx = bus.subscribe();
        let client = Arc::new(client(bus));

        let responder = client.clone();
        tokio::spawn(async move {
            let msg = rx.recv().await.unwrap();
            assert_eq!(msg.subject, subjects::RETRIEVAL_SEARCH_REQUEST);
            let request: RetrievalRequest = serde_json::from_value(msg.payload).unwrap();
            responder
                .deliver_result(RetrievalResult {
                    request_id: request.request_id,
                    hits: vec![RetrievalHit {
                        filepath: "src/lib.rs".into(),
                        content: "pub fn lib() {}".into(),
                        score: 0.8,
                        symbol_name: None,
                        hops: None,
                    }],
                    error: None,
                })
                .await;
        });

        let hits = client.search("p-1", "lib", 5).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].filepath, "src/lib.rs");
    }

    #[tokio::test]
    async fn timeout_marks_path_unhealthy_and_fast_fails() {
        let bus = Arc::new(BroadcastBus::new());
        let client = client(bus);

        let first = client.search("p-1", "anything", 5).await;
        assert!(first.unwrap_err().to_string().contains("timed out"));

        let second = client.search("p-1", "anything", 5).await;
        assert!(second.unwrap_err().to_string().contains("cooling down"));
    }

    #[tokio::test]
    async fn error_result_fails_the_call() {
        let bus = Arc::new(BroadcastBus::new());
        let mut rx = bus.subscribe();
        let client = Arc::new(client(bus));

        let responder = client.clone();
        tokio::spawn(async move {
            let msg = rx.recv().await.unwrap();
            let request: RetrievalRequest = serde_json::from_value(msg.payload).unwrap();
            responder
                .deliver_result(RetrievalResult {
                    request_id: request.request_id,
                    hits: Vec::new(),
                    error: Some("index unavailable".into()),
                })
                .await;
        });

        let err = client.search("p-1", "query", 5).await.unwrap_err();
        assert!(err.to_string().contains("index unavailable"));
    }
}
