//! In-memory node registry.
//!
//! The registry owns the authoritative node list. Every write goes through a
//! single write lock and hands the resulting list to the [`ChangeNotifier`]
//! before the lock is released, so a reader that runs after a write returns
//! always observes it and the notifier never sees writes out of order.

use tokio::sync::{broadcast, RwLock};

use crate::model::{NodeRecord, SceneDemandConfig};
use crate::notifier::{ChangeNotifier, PoolEvent};

/// Authoritative node list plus the current demand view.
pub struct NodeRegistry {
    nodes: RwLock<Vec<NodeRecord>>,
    notifier: ChangeNotifier,
}

impl NodeRegistry {
    pub fn new(notifier: ChangeNotifier) -> Self {
        Self {
            nodes: RwLock::new(Vec::new()),
            notifier,
        }
    }

    /// Snapshot of the node list, in registry order.
    pub async fn get(&self) -> Vec<NodeRecord> {
        self.nodes.read().await.clone()
    }

    /// Replace the whole list.
    pub async fn set(&self, nodes: Vec<NodeRecord>) {
        let mut guard = self.nodes.write().await;
        self.notifier.notify(nodes.clone());
        *guard = nodes;
    }

    /// Mutate the list in place under the write lock. Always notifies.
    pub async fn update<R>(&self, f: impl FnOnce(&mut Vec<NodeRecord>) -> R) -> R {
        let mut guard = self.nodes.write().await;
        let result = f(&mut guard);
        self.notifier.notify(guard.clone());
        result
    }

    /// Like [`update`](Self::update), but only notifies when `f` returns `Some`.
    ///
    /// `f` must leave the list untouched when it returns `None`.
    pub async fn try_update<R>(
        &self,
        f: impl FnOnce(&mut Vec<NodeRecord>) -> Option<R>,
    ) -> Option<R> {
        let mut guard = self.nodes.write().await;
        let result = f(&mut guard)?;
        self.notifier.notify(guard.clone());
        Some(result)
    }

    /// Enable or suppress change events. Snapshots are persisted either way.
    pub fn set_flag(&self, enable_notify: bool) {
        self.notifier.set_enabled(enable_notify);
    }

    pub fn notifications_enabled(&self) -> bool {
        self.notifier.is_enabled()
    }

    /// Suppress change events until the returned guard is dropped.
    pub fn pause_notifications(&self) -> NotifyPause<'_> {
        self.set_flag(false);
        NotifyPause { registry: self }
    }

    /// Replace the active demand list carried by change events.
    pub async fn set_demand(&self, demand: Vec<SceneDemandConfig>) {
        self.notifier.set_demand(demand).await;
    }

    pub async fn demand(&self) -> Vec<SceneDemandConfig> {
        self.notifier.demand().await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.notifier.subscribe()
    }

    pub fn publish(&self, event: PoolEvent) {
        self.notifier.publish(event);
    }
}

/// Re-enables change events on drop.
pub struct NotifyPause<'a> {
    registry: &'a NodeRegistry,
}

impl Drop for NotifyPause<'_> {
    fn drop(&mut self) {
        self.registry.set_flag(true);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::persistence::MemorySnapshotStore;
    use serde_json::json;

    fn node(engine_id: &str, scene_id: &str) -> NodeRecord {
        serde_json::from_value(json!({"engineId": engine_id, "sceneId": scene_id})).unwrap()
    }

    fn registry(store: Arc<MemorySnapshotStore>) -> NodeRegistry {
        NodeRegistry::new(ChangeNotifier::spawn(Duration::from_millis(100), store))
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_then_get() {
        let store = Arc::new(MemorySnapshotStore::new());
        let registry = registry(store.clone());

        registry.set(vec![node("e1", "S1"), node("e2", "S2")]).await;
        let nodes = registry.get().await;
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[1].engine_id, "e2");

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(store.save_count().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_try_update_none_does_not_notify() {
        let store = Arc::new(MemorySnapshotStore::new());
        let registry = registry(store.clone());

        let result: Option<()> = registry.try_update(|_| None).await;
        assert!(result.is_none());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(store.save_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_returns_closure_result() {
        let registry = registry(Arc::new(MemorySnapshotStore::new()));
        registry.set(vec![node("e1", "S1"), node("e2", "S2")]).await;

        let removed = registry
            .update(|nodes| {
                let before = nodes.len();
                nodes.retain(|n| n.scene_id != "S1");
                before - nodes.len()
            })
            .await;

        assert_eq!(removed, 1);
        assert_eq!(registry.get().await[0].engine_id, "e2");
    }

    #[tokio::test]
    async fn test_pause_guard_restores_flag() {
        let registry = registry(Arc::new(MemorySnapshotStore::new()));
        assert!(registry.notifications_enabled());

        {
            let _pause = registry.pause_notifications();
            assert!(!registry.notifications_enabled());
        }

        assert!(registry.notifications_enabled());
    }
}
