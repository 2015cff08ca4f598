//! Node pool reconciliation loop.
//!
//! Every [`PoolEvent::RegistryChanged`] triggers one pass:
//! 1. Tear down nodes whose scene is no longer in demand (orphans)
//! 2. Group the remaining nodes by scene
//! 3. Skip the pass if another one is still in flight
//! 4. Walk scenes in demand order and apply the first action any scene needs
//!
//! A pass makes at most one topology change. The resulting registry write
//! produces the next event, which re-derives the state from scratch, so
//! dropped events never lose work.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use renderpool_reconcile::{group_by, plan_scene, select_tail, PoolAction, PoolCounts};
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::backend::RenderBackend;
use crate::fetcher::{AdmitOutcome, DemandFetcher};
use crate::model::{NodeRecord, SceneDemandConfig};
use crate::notifier::PoolEvent;
use crate::registry::NodeRegistry;
use crate::session::SessionLauncher;

/// What a single pass did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PassOutcome {
    /// Another pass was in flight.
    Skipped,

    /// No scene needed an action.
    Converged,

    Created { scene_id: String, engine_id: String },

    /// Session creation failed; nothing was written.
    CreateFailed { scene_id: String },

    Destroyed { scene_id: String, count: usize },

    /// A session was created but its scene went inactive before admission.
    Discarded { scene_id: String },
}

/// Result of one pass, including the teardowns it started.
#[derive(Debug)]
pub struct PassReport {
    pub outcome: PassOutcome,

    /// Orphaned nodes torn down at the start of the pass.
    pub orphans: usize,

    teardowns: Vec<JoinHandle<()>>,
}

impl PassReport {
    fn new(outcome: PassOutcome, orphans: usize, teardowns: Vec<JoinHandle<()>>) -> Self {
        Self {
            outcome,
            orphans,
            teardowns,
        }
    }

    /// Number of teardown tasks started by the pass.
    pub fn teardown_count(&self) -> usize {
        self.teardowns.len()
    }

    /// Wait for every teardown started by the pass.
    pub async fn wait_teardowns(self) -> PassOutcome {
        for handle in self.teardowns {
            if let Err(e) = handle.await {
                error!(error = %e, "Teardown task panicked");
            }
        }
        self.outcome
    }
}

/// Clears the busy flag on drop.
struct BusyGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> BusyGuard<'a> {
    fn try_acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { flag })
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// The reconciliation loop.
pub struct PoolReconciler {
    registry: Arc<NodeRegistry>,
    fetcher: Arc<DemandFetcher>,
    launcher: Arc<dyn SessionLauncher>,
    backend: Arc<dyn RenderBackend>,
    busy: AtomicBool,

    /// Node list of the previous event, minus the orphans it tore down.
    previous: Mutex<Vec<NodeRecord>>,
}

impl PoolReconciler {
    pub fn new(
        registry: Arc<NodeRegistry>,
        fetcher: Arc<DemandFetcher>,
        launcher: Arc<dyn SessionLauncher>,
        backend: Arc<dyn RenderBackend>,
    ) -> Self {
        Self {
            registry,
            fetcher,
            launcher,
            backend,
            busy: AtomicBool::new(false),
            previous: Mutex::new(Vec::new()),
        }
    }

    /// Seed the previous node list, so nodes the first refresh filters out
    /// are still caught by orphan detection.
    pub async fn remember(&self, nodes: Vec<NodeRecord>) {
        *self.previous.lock().await = nodes;
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Consume pool events until shutdown. Each change is handled on its own
    /// task so a slow pass never blocks event intake.
    #[instrument(skip(self, events, shutdown))]
    pub async fn run(
        self: Arc<Self>,
        mut events: broadcast::Receiver<PoolEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("Starting pool reconciler");

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(PoolEvent::RegistryChanged { nodes, demand }) => {
                        let reconciler = Arc::clone(&self);
                        tokio::spawn(async move {
                            reconciler.handle_change(nodes, demand).await;
                        });
                    }
                    Ok(PoolEvent::NodeAdded(_)) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Reconciler lagged behind pool events");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        info!("Pool event channel closed");
                        break;
                    }
                },
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Pool reconciler shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Run one reconciliation pass for a settled registry value.
    pub async fn handle_change(
        &self,
        nodes: Vec<NodeRecord>,
        demand: Vec<SceneDemandConfig>,
    ) -> PassReport {
        let (remaining, mut teardowns) = self.tear_down_orphans(nodes, &demand).await;
        let orphans = teardowns.len();

        let Some(_busy) = BusyGuard::try_acquire(&self.busy) else {
            debug!("Reconciliation pass in flight, skipping event");
            return PassReport::new(PassOutcome::Skipped, orphans, teardowns);
        };

        let mut groups = group_by(remaining, |n| n.scene_id.clone());

        for scene in &demand {
            let scene_nodes = groups.remove(&scene.scene_id).unwrap_or_default();
            let idle: Vec<NodeRecord> = scene_nodes
                .iter()
                .filter(|n| n.is_idle())
                .cloned()
                .collect();
            let counts = PoolCounts::new(scene_nodes.len(), idle.len());

            let Some(action) = plan_scene(&scene.targets(), counts) else {
                continue;
            };

            info!(
                scene_id = %scene.scene_id,
                total = counts.total,
                idle = counts.idle,
                action = action.label(),
                "Scene needs reconciliation"
            );

            let outcome = match action {
                PoolAction::Create(_) => self.create_node(scene, &mut teardowns).await,
                PoolAction::Destroy { count, .. } => {
                    let doomed = select_tail(idle, count);
                    let removed = self.remove_idle(doomed).await;
                    if removed.is_empty() {
                        debug!(
                            scene_id = %scene.scene_id,
                            "Selected nodes were claimed before removal, nothing destroyed"
                        );
                        PassOutcome::Converged
                    } else {
                        let count = removed.len();
                        teardowns.extend(removed.into_iter().map(|n| self.spawn_teardown(n)));
                        PassOutcome::Destroyed {
                            scene_id: scene.scene_id.clone(),
                            count,
                        }
                    }
                }
            };
            return PassReport::new(outcome, orphans, teardowns);
        }

        debug!(scene_count = demand.len(), "Pool converged");
        PassReport::new(PassOutcome::Converged, orphans, teardowns)
    }

    /// Tear down nodes of the previous and current lists whose scene left the
    /// demand list. Returns the surviving current nodes.
    async fn tear_down_orphans(
        &self,
        nodes: Vec<NodeRecord>,
        demand: &[SceneDemandConfig],
    ) -> (Vec<NodeRecord>, Vec<JoinHandle<()>>) {
        let wanted: HashSet<&str> = demand.iter().map(|s| s.scene_id.as_str()).collect();
        let mut previous = self.previous.lock().await;

        let mut seen = HashSet::new();
        let mut orphans = Vec::new();
        for node in previous.iter().chain(nodes.iter()) {
            if !wanted.contains(node.scene_id.as_str()) && seen.insert(node.engine_id.clone()) {
                orphans.push(node.clone());
            }
        }

        let remaining: Vec<NodeRecord> = nodes
            .into_iter()
            .filter(|n| !seen.contains(&n.engine_id))
            .collect();
        *previous = remaining.clone();
        drop(previous);

        if orphans.is_empty() {
            return (remaining, Vec::new());
        }

        for orphan in &orphans {
            info!(
                engine_id = %orphan.engine_id,
                scene_id = %orphan.scene_id,
                "Scene no longer in demand, tearing down node"
            );
        }
        let teardowns = self.remove_and_tear_down(orphans).await;
        (remaining, teardowns)
    }

    async fn create_node(
        &self,
        scene: &SceneDemandConfig,
        teardowns: &mut Vec<JoinHandle<()>>,
    ) -> PassOutcome {
        let session = match self.launcher.create(scene).await {
            Ok(session) => session,
            Err(e) => {
                warn!(scene_id = %scene.scene_id, error = %e, "Failed to create node");
                return PassOutcome::CreateFailed {
                    scene_id: scene.scene_id.clone(),
                };
            }
        };

        match self.fetcher.admit_created(session, scene).await {
            AdmitOutcome::Added(record) => {
                let engine_id = record.engine_id.clone();
                self.registry.publish(PoolEvent::NodeAdded(record));
                PassOutcome::Created {
                    scene_id: scene.scene_id.clone(),
                    engine_id,
                }
            }
            AdmitOutcome::AlreadyTracked => PassOutcome::Converged,
            AdmitOutcome::SceneInactive(session) => {
                warn!(
                    engine_id = %session.engine_id(),
                    scene_id = %scene.scene_id,
                    "Scene went inactive during creation, discarding node"
                );
                let record = NodeRecord {
                    engine_id: session.engine_id().to_string(),
                    scene_id: scene.scene_id.clone(),
                    is_distributed: false,
                    true_name: None,
                    session: Some(session),
                    metadata: Default::default(),
                };
                teardowns.push(self.spawn_teardown(record));
                PassOutcome::Discarded {
                    scene_id: scene.scene_id.clone(),
                }
            }
        }
    }

    /// Drop orphans from the registry and start their teardowns, whether or
    /// not they are still tracked.
    async fn remove_and_tear_down(&self, doomed: Vec<NodeRecord>) -> Vec<JoinHandle<()>> {
        let ids: HashSet<&str> = doomed.iter().map(|n| n.engine_id.as_str()).collect();
        self.registry
            .try_update(|nodes| {
                let before = nodes.len();
                nodes.retain(|n| !ids.contains(n.engine_id.as_str()));
                (nodes.len() < before).then_some(())
            })
            .await;

        doomed
            .into_iter()
            .map(|node| self.spawn_teardown(node))
            .collect()
    }

    /// Drop the given nodes from the registry if they are still idle.
    ///
    /// The selection comes from an event payload, so a node may have been
    /// claimed since. Returns the records actually removed.
    async fn remove_idle(&self, doomed: Vec<NodeRecord>) -> Vec<NodeRecord> {
        let ids: HashSet<&str> = doomed.iter().map(|n| n.engine_id.as_str()).collect();
        self.registry
            .try_update(|nodes| {
                let (removed, kept): (Vec<NodeRecord>, Vec<NodeRecord>) = std::mem::take(nodes)
                    .into_iter()
                    .partition(|n| n.is_idle() && ids.contains(n.engine_id.as_str()));
                *nodes = kept;
                (!removed.is_empty()).then_some(removed)
            })
            .await
            .unwrap_or_default()
    }

    /// Close a node's session without waiting for it.
    ///
    /// Uses the session handle when this process holds one, otherwise asks
    /// the render service to kill the engine by id.
    fn spawn_teardown(&self, node: NodeRecord) -> JoinHandle<()> {
        let launcher = Arc::clone(&self.launcher);
        let backend = Arc::clone(&self.backend);

        tokio::spawn(async move {
            let result = match &node.session {
                Some(handle) => {
                    debug!(engine_id = %node.engine_id, token = handle.token(), "Closing session");
                    launcher.destroy(handle).await
                }
                None => backend.kill_session(&node.engine_id).await,
            };

            match result {
                Ok(()) => debug!(engine_id = %node.engine_id, "Node torn down"),
                Err(e) => warn!(
                    engine_id = %node.engine_id,
                    scene_id = %node.scene_id,
                    error = %e,
                    "Failed to tear down node"
                ),
            }
        })
    }
}
