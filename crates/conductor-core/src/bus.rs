use serde_json::Value;
use tokio::sync::broadcast;

use conductor_types::{BusMessage, EngineEvent};

/// Transport seam to the worker plane. The in-process implementation backs
/// tests and single-node deployments; a networked bus plugs in behind the
/// same trait.
pub trait MessageBus: Send + Sync {
    fn publish(&self, subject: &str, payload: Value) -> anyhow::Result<()>;

    fn subscribe(&self) -> broadcast::Receiver<BusMessage>;
}

#[derive(Clone)]
pub struct BroadcastBus {
    tx: broadcast::Sender<BusMessage>,
}

impl BroadcastBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(2048);
        Self { tx }
    }
}

impl Default for BroadcastBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageBus for BroadcastBus {
    fn publish(&self, subject: &str, payload: Value) -> anyhow::Result<()> {
        // A send with no subscribers is not an error; workers may attach late.
        let _ = self.tx.send(BusMessage::new(subject, payload));
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<BusMessage> {
        self.tx.subscribe()
    }
}

/// Fan-out for native and AG-UI status events toward WebSocket consumers.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(2048);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: EngineEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
