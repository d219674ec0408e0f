use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::{watch, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_HEALTH_COOLDOWN: Duration = Duration::from_secs(30);

/// Correlation-ID → single-shot channel map. A request registers a fresh ID,
/// publishes, and waits; the response handler delivers by the same ID.
/// Delivery removes the sender, so exactly one delivery wins and the
/// payload is observed at most once.
pub struct WaiterRegistry<T: Clone + Send + Sync + 'static> {
    waiters: RwLock<HashMap<String, watch::Sender<Option<T>>>>,
}

impl<T: Clone + Send + Sync + 'static> WaiterRegistry<T> {
    pub fn new() -> Self {
        Self {
            waiters: RwLock::new(HashMap::new()),
        }
    }

    pub async fn register(&self, id: &str) -> watch::Receiver<Option<T>> {
        let (tx, rx) = watch::channel(None);
        self.waiters.write().await.insert(id.to_string(), tx);
        rx
    }

    pub async fn unregister(&self, id: &str) {
        self.waiters.write().await.remove(id);
    }

    pub async fn deliver(&self, id: &str, payload: T) -> bool {
        let Some(tx) = self.waiters.write().await.remove(id) else {
            return false;
        };
        tx.send(Some(payload)).is_ok()
    }

    /// Wait for delivery, a deadline, or cancellation; the waiter is
    /// unregistered on every exit path.
    pub async fn wait(
        &self,
        id: &str,
        deadline: Duration,
        cancel: &CancellationToken,
    ) -> Option<T> {
        let mut rx = self.register(id).await;
        let outcome = tokio::select! {
            _ = cancel.cancelled() => None,
            _ = tokio::time::sleep(deadline) => None,
            changed = rx.changed() => {
                if changed.is_ok() {
                    rx.borrow().clone()
                } else {
                    None
                }
            }
        };
        self.unregister(id).await;
        outcome
    }

    pub async fn len(&self) -> usize {
        self.waiters.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.waiters.read().await.is_empty()
    }
}

impl<T: Clone + Send + Sync + 'static> Default for WaiterRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Coarse per-path cooldown. After a failure or timeout on a logical path,
/// synchronous callers fast-fail for the cooldown window instead of
/// dog-piling an unhealthy worker.
pub struct HealthGate {
    cooldown: Duration,
    unhealthy_until: RwLock<HashMap<String, Instant>>,
}

impl HealthGate {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            unhealthy_until: RwLock::new(HashMap::new()),
        }
    }

    pub async fn mark_unhealthy(&self, path: &str) {
        self.unhealthy_until
            .write()
            .await
            .insert(path.to_string(), Instant::now() + self.cooldown);
    }

    pub async fn is_cooling_down(&self, path: &str) -> bool {
        let now = Instant::now();
        {
            let map = self.unhealthy_until.read().await;
            match map.get(path) {
                Some(until) if *until > now => return true,
                Some(_) => {}
                None => return false,
            }
        }
        self.unhealthy_until.write().await.remove(path);
        false
    }
}

impl Default for HealthGate {
    fn default() -> Self {
        Self::new(DEFAULT_HEALTH_COOLDOWN)
    }
}

/// Fresh 128-bit hex correlation ID.
pub fn correlation_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn delivery_is_single_shot() {
        let registry: WaiterRegistry<String> = WaiterRegistry::new();
        let _rx = registry.register("req-1").await;
        assert!(registry.deliver("req-1", "hello".into()).await);
        assert!(!registry.deliver("req-1", "again".into()).await);
    }

    #[tokio::test]
    async fn deliver_to_unknown_id_returns_false() {
        let registry: WaiterRegistry<u32> = WaiterRegistry::new();
        assert!(!registry.deliver("nope", 7).await);
    }

    #[tokio::test]
    async fn wait_returns_delivered_payload_and_unregisters() {
        let registry = Arc::new(WaiterRegistry::<String>::new());
        let delivering = registry.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            delivering.deliver("req-1", "payload".into()).await;
        });
        let cancel = CancellationToken::new();
        let got = registry
            .wait("req-1", Duration::from_secs(5), &cancel)
            .await;
        assert_eq!(got.as_deref(), Some("payload"));
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn wait_times_out_and_unregisters() {
        let registry: WaiterRegistry<String> = WaiterRegistry::new();
        let cancel = CancellationToken::new();
        let got = registry
            .wait("req-1", Duration::from_millis(20), &cancel)
            .await;
        assert!(got.is_none());
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn wait_honors_cancellation() {
        let registry: WaiterRegistry<String> = WaiterRegistry::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let got = registry.wait("req-1", Duration::from_secs(5), &cancel).await;
        assert!(got.is_none());
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn health_gate_cools_down_then_reopens() {
        tokio::time::pause();
        let gate = HealthGate::new(Duration::from_secs(30));
        assert!(!gate.is_cooling_down("retrieval.search").await);
        gate.mark_unhealthy("retrieval.search").await;
        assert!(gate.is_cooling_down("retrieval.search").await);
        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(!gate.is_cooling_down("retrieval.search").await);
    }

    #[test]
    fn correlation_ids_are_32_hex_chars() {
        let id = correlation_id();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(id, correlation_id());
    }
}
