use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

use conductor_types::{subjects, BusMessage};

use crate::bus::MessageBus;
use crate::engine::RuntimeEngine;
use crate::retrieval::BusRetrievalClient;

/// Drains the bus subscription and dispatches decoded payloads to the engine
/// and the retrieval correlator. Malformed payloads are logged and dropped;
/// the task unwinds when the root token is cancelled.
pub struct BusSubscribers {
    engine: RuntimeEngine,
    retrieval: Option<Arc<BusRetrievalClient>>,
}

impl BusSubscribers {
    pub fn new(engine: RuntimeEngine, retrieval: Option<Arc<BusRetrievalClient>>) -> Self {
        Self { engine, retrieval }
    }

    /// Spawn the dispatch task. Returns the cancellation token that stops it.
    pub fn spawn(self, bus: Arc<dyn MessageBus>) -> CancellationToken {
        let root = self.engine.shutdown_token();
        let cancel = root.clone();
        let mut rx = bus.subscribe();
        tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    _ = cancel.cancelled() => break,
                    received = rx.recv() => match received {
                        Ok(message) => message,
                        Err(RecvError::Lagged(missed)) => {
                            tracing::warn!(missed, "bus subscriber lagged, messages dropped");
                            continue;
                        }
                        Err(RecvError::Closed) => break,
                    },
                };
                self.dispatch(message).await;
            }
        });
        root
    }

    pub async fn dispatch(&self, message: BusMessage) {
        match message.subject.as_str() {
            subjects::TOOL_CALL_REQUEST => {
                if let Some(request) = decode(&message.subject, message.payload) {
                    self.engine.handle_tool_call_request(request).await;
                }
            }
            subjects::TOOL_CALL_RESULT => {
                if let Some(result) = decode(&message.subject, message.payload) {
                    self.engine.handle_tool_call_result(result).await;
                }
            }
            subjects::RUN_COMPLETE => {
                if let Some(payload) = decode(&message.subject, message.payload) {
                    self.engine.handle_run_complete(payload).await;
                }
            }
            subjects::RUN_HEARTBEAT => {
                if let Some(payload) = decode(&message.subject, message.payload) {
                    self.engine.handle_heartbeat(payload).await;
                }
            }
            subjects::RUN_OUTPUT => {
                if let Some(payload) = decode(&message.subject, message.payload) {
                    self.engine.handle_run_output(payload).await;
                }
            }
            subjects::QUALITY_GATE_RESULT => {
                if let Some(result) = decode(&message.subject, message.payload) {
                    self.engine.handle_quality_gate_result(result).await;
                }
            }
            subjects::RETRIEVAL_SEARCH_RESULT
            | subjects::RETRIEVAL_SUBAGENT_RESULT
            | subjects::RETRIEVAL_GRAPH_RESULT => {
                if let Some(retrieval) = self.retrieval.as_ref() {
                    if let Some(result) = decode(&message.subject, message.payload) {
                        retrieval.deliver_result(result).await;
                    }
                }
            }
            _ => {}
        }
    }
}

fn decode<T: DeserializeOwned>(subject: &str, payload: Value) -> Option<T> {
    match serde_json::from_value(payload) {
        Ok(decoded) => Some(decoded),
        Err(err) => {
            tracing::warn!(subject, "malformed bus payload dropped: {err}");
            None
        }
    }
}
