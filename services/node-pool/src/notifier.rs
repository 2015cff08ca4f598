//! Debounced registry change notification.
//!
//! Every registry write hands the new node list to the notifier. Writes that
//! land within the debounce window collapse into a single trailing firing that
//! uses the last list written. On firing the notifier:
//! 1. Persists the list (failures are logged, never propagated)
//! 2. Broadcasts [`PoolEvent::RegistryChanged`] if notifications are enabled
//!
//! Both steps use the same value, so a saved snapshot and the event emitted
//! after it always describe the same write.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, RwLock};
use tracing::{debug, error};

use crate::model::{NodeRecord, SceneDemandConfig};
use crate::persistence::SnapshotStore;

/// Capacity of the pool event channel.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Events published to pool subscribers.
#[derive(Debug, Clone)]
pub enum PoolEvent {
    /// The registry settled on a new value. Both lists are owned copies.
    RegistryChanged {
        nodes: Vec<NodeRecord>,
        demand: Vec<SceneDemandConfig>,
    },

    /// A freshly created node is available for distribution.
    NodeAdded(NodeRecord),
}

struct NotifierShared {
    enabled: AtomicBool,
    demand: RwLock<Vec<SceneDemandConfig>>,
}

/// Handle to the debounce task.
#[derive(Clone)]
pub struct ChangeNotifier {
    pending: mpsc::UnboundedSender<Vec<NodeRecord>>,
    events: broadcast::Sender<PoolEvent>,
    shared: Arc<NotifierShared>,
}

impl ChangeNotifier {
    /// Start the debounce task.
    ///
    /// The task exits once every handle has been dropped, after flushing a
    /// pending value.
    pub fn spawn(delay: Duration, store: Arc<dyn SnapshotStore>) -> Self {
        let (pending, rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let shared = Arc::new(NotifierShared {
            enabled: AtomicBool::new(true),
            demand: RwLock::new(Vec::new()),
        });

        tokio::spawn(run_debounce_loop(
            rx,
            delay,
            store,
            events.clone(),
            Arc::clone(&shared),
        ));

        Self {
            pending,
            events,
            shared,
        }
    }

    /// Queue a node list. Restarts the debounce window.
    pub fn notify(&self, nodes: Vec<NodeRecord>) {
        if self.pending.send(nodes).is_err() {
            error!("Change notifier task is gone, dropping registry update");
        }
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.shared.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_enabled(&self) -> bool {
        self.shared.enabled.load(Ordering::SeqCst)
    }

    /// Replace the demand list carried by subsequent events.
    pub async fn set_demand(&self, demand: Vec<SceneDemandConfig>) {
        *self.shared.demand.write().await = demand;
    }

    pub async fn demand(&self) -> Vec<SceneDemandConfig> {
        self.shared.demand.read().await.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.events.subscribe()
    }

    /// Publish an event directly, bypassing the debounce.
    pub fn publish(&self, event: PoolEvent) {
        if self.events.send(event).is_err() {
            debug!("No pool event subscribers");
        }
    }
}

async fn run_debounce_loop(
    mut rx: mpsc::UnboundedReceiver<Vec<NodeRecord>>,
    delay: Duration,
    store: Arc<dyn SnapshotStore>,
    events: broadcast::Sender<PoolEvent>,
    shared: Arc<NotifierShared>,
) {
    while let Some(mut latest) = rx.recv().await {
        let mut closed = false;

        // Trailing edge: every new value restarts the window.
        loop {
            tokio::select! {
                _ = tokio::time::sleep(delay) => break,
                next = rx.recv() => match next {
                    Some(nodes) => latest = nodes,
                    None => {
                        closed = true;
                        break;
                    }
                },
            }
        }

        fire(latest, &store, &events, &shared).await;

        if closed {
            break;
        }
    }

    debug!("Change notifier stopped");
}

async fn fire(
    nodes: Vec<NodeRecord>,
    store: &Arc<dyn SnapshotStore>,
    events: &broadcast::Sender<PoolEvent>,
    shared: &NotifierShared,
) {
    if let Err(e) = store.save(&nodes).await {
        error!(error = %e, node_count = nodes.len(), "Failed to persist node snapshot");
    }

    if !shared.enabled.load(Ordering::SeqCst) {
        debug!(node_count = nodes.len(), "Notifications paused, not emitting");
        return;
    }

    let demand = shared.demand.read().await.clone();
    debug!(
        node_count = nodes.len(),
        scene_count = demand.len(),
        "Registry changed"
    );
    if events
        .send(PoolEvent::RegistryChanged { nodes, demand })
        .is_err()
    {
        debug!("No pool event subscribers");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::MemorySnapshotStore;
    use serde_json::json;
    use tokio::sync::broadcast::error::TryRecvError;

    fn node(engine_id: &str) -> NodeRecord {
        serde_json::from_value(json!({"engineId": engine_id, "sceneId": "S1"})).unwrap()
    }

    fn scene(id: &str) -> SceneDemandConfig {
        serde_json::from_value(json!({"sceneId": id, "isActive": true})).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_writes_within_window_collapse() {
        let store = Arc::new(MemorySnapshotStore::new());
        let notifier = ChangeNotifier::spawn(Duration::from_millis(1500), store.clone());
        let mut events = notifier.subscribe();
        notifier.set_demand(vec![scene("S1")]).await;

        for i in 0..5 {
            notifier.notify(vec![node(&format!("e{i}"))]);
            tokio::time::sleep(Duration::from_millis(500)).await;
        }

        let event = events.recv().await.unwrap();
        match event {
            PoolEvent::RegistryChanged { nodes, demand } => {
                assert_eq!(nodes.len(), 1);
                assert_eq!(nodes[0].engine_id, "e4");
                assert_eq!(demand[0].scene_id, "S1");
            }
            other => panic!("unexpected event: {other:?}"),
        }

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));
        assert_eq!(store.save_count().await, 1);
        assert_eq!(store.last_saved().await.unwrap()[0].engine_id, "e4");
    }

    #[tokio::test(start_paused = true)]
    async fn test_writes_outside_window_fire_separately() {
        let store = Arc::new(MemorySnapshotStore::new());
        let notifier = ChangeNotifier::spawn(Duration::from_millis(1500), store.clone());
        let mut events = notifier.subscribe();

        notifier.notify(vec![node("e1")]);
        tokio::time::sleep(Duration::from_secs(2)).await;
        notifier.notify(vec![node("e1"), node("e2")]);
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert!(matches!(events.recv().await.unwrap(), PoolEvent::RegistryChanged { nodes, .. } if nodes.len() == 1));
        assert!(matches!(events.recv().await.unwrap(), PoolEvent::RegistryChanged { nodes, .. } if nodes.len() == 2));
        assert_eq!(store.save_count().await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_paused_notifier_persists_without_emitting() {
        let store = Arc::new(MemorySnapshotStore::new());
        let notifier = ChangeNotifier::spawn(Duration::from_millis(1500), store.clone());
        let mut events = notifier.subscribe();

        notifier.set_enabled(false);
        notifier.notify(vec![node("e1")]);
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert_eq!(store.save_count().await, 1);
        assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_event_is_a_snapshot() {
        let store = Arc::new(MemorySnapshotStore::new());
        let notifier = ChangeNotifier::spawn(Duration::from_millis(100), store);
        let mut events = notifier.subscribe();

        let mut nodes = vec![node("e1")];
        notifier.notify(nodes.clone());
        nodes[0].is_distributed = true;

        let PoolEvent::RegistryChanged { nodes: seen, .. } = events.recv().await.unwrap() else {
            panic!("expected registry change");
        };
        assert!(!seen[0].is_distributed);
    }

    #[tokio::test]
    async fn test_publish_node_added() {
        let notifier = ChangeNotifier::spawn(
            Duration::from_millis(10),
            Arc::new(MemorySnapshotStore::new()),
        );
        let mut events = notifier.subscribe();

        notifier.publish(PoolEvent::NodeAdded(node("e7")));
        assert!(matches!(events.recv().await.unwrap(), PoolEvent::NodeAdded(n) if n.engine_id == "e7"));
    }
}
