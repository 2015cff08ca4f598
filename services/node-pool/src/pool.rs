//! Node pool wiring.
//!
//! Builds the registry, notifier, fetcher, reconciler and sweeper around one
//! backend, one session launcher and one snapshot store, and runs the startup
//! sequence.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::backend::RenderBackend;
use crate::fetcher::DemandFetcher;
use crate::notifier::ChangeNotifier;
use crate::persistence::{load_seed, SnapshotStore};
use crate::reconciler::PoolReconciler;
use crate::registry::NodeRegistry;
use crate::session::SessionLauncher;
use crate::sweeper::{OrphanSweeper, SweepReport};

/// Timing knobs of the pool.
#[derive(Debug, Clone, Copy)]
pub struct PoolTiming {
    pub debounce_delay: Duration,
    pub poll_interval: Duration,
}

/// The assembled pool components.
pub struct NodePool {
    pub registry: Arc<NodeRegistry>,
    pub fetcher: Arc<DemandFetcher>,
    pub reconciler: Arc<PoolReconciler>,
    pub sweeper: OrphanSweeper,
    store: Arc<dyn SnapshotStore>,
}

impl NodePool {
    /// Must be called inside a tokio runtime; spawns the notifier task.
    pub fn new(
        backend: Arc<dyn RenderBackend>,
        launcher: Arc<dyn SessionLauncher>,
        store: Arc<dyn SnapshotStore>,
        timing: PoolTiming,
    ) -> Self {
        let notifier = ChangeNotifier::spawn(timing.debounce_delay, Arc::clone(&store));
        let registry = Arc::new(NodeRegistry::new(notifier));
        let fetcher = Arc::new(DemandFetcher::new(
            Arc::clone(&registry),
            Arc::clone(&backend),
            timing.poll_interval,
        ));
        let reconciler = Arc::new(PoolReconciler::new(
            Arc::clone(&registry),
            Arc::clone(&fetcher),
            Arc::clone(&launcher),
            Arc::clone(&backend),
        ));
        let sweeper = OrphanSweeper::new(backend, launcher);

        Self {
            registry,
            fetcher,
            reconciler,
            sweeper,
            store,
        }
    }

    /// Startup sequence: load the persisted seed, refresh the registry from
    /// it, then sweep sessions left without clients.
    ///
    /// Subscribe to pool events before calling this, or the first change
    /// event is missed.
    pub async fn start(&self) -> SweepReport {
        let seed = load_seed(self.store.as_ref()).await;
        info!(seed_count = seed.len(), "Starting node pool");

        self.reconciler.remember(seed.clone()).await;
        self.fetcher.refresh(seed.clone()).await;
        self.sweeper.sweep(&seed).await
    }
}
