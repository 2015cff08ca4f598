//! Demand fetcher.
//!
//! Pulls live sessions and scene demand from the backend, then narrows the
//! registry to nodes whose scene is still active and whose session is still
//! alive. Runs once at startup with the persisted seed and then on a fixed
//! period; the reconciler also calls it right before admitting a new node.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use crate::backend::RenderBackend;
use crate::error::PoolResult;
use crate::model::{LiveSessionSet, NodeRecord, SceneDemandConfig};
use crate::registry::NodeRegistry;
use crate::session::SessionHandle;

/// The two external datasets fetched by one refresh.
#[derive(Debug, Clone)]
pub struct DemandSnapshot {
    pub live_sessions: LiveSessionSet,

    /// Every scene the management API returned, active or not.
    pub demand: Vec<SceneDemandConfig>,
}

impl DemandSnapshot {
    /// The active config for a scene, if any.
    pub fn active_scene(&self, scene_id: &str) -> Option<&SceneDemandConfig> {
        self.demand
            .iter()
            .find(|s| s.is_active && s.scene_id == scene_id)
    }
}

/// Result of admitting a freshly created session into the registry.
#[derive(Debug)]
pub enum AdmitOutcome {
    /// Appended to the registry.
    Added(NodeRecord),

    /// The engine id was already tracked; nothing was written.
    AlreadyTracked,

    /// The scene is no longer active. The session is handed back for teardown.
    SceneInactive(SessionHandle),
}

/// Periodic refresher of the registry's demand view.
pub struct DemandFetcher {
    registry: Arc<NodeRegistry>,
    backend: Arc<dyn RenderBackend>,
    interval: Duration,
}

impl DemandFetcher {
    pub fn new(
        registry: Arc<NodeRegistry>,
        backend: Arc<dyn RenderBackend>,
        interval: Duration,
    ) -> Self {
        Self {
            registry,
            backend,
            interval,
        }
    }

    /// Refresh the registry from the backend.
    ///
    /// A non-empty `seed` replaces the registry contents before filtering;
    /// otherwise the current registry is filtered in place. On fetch failure
    /// the registry and demand view are left untouched and `None` is returned.
    pub async fn refresh(&self, seed: Vec<NodeRecord>) -> Option<DemandSnapshot> {
        match self.try_refresh(seed).await {
            Ok(snapshot) => Some(snapshot),
            Err(e) if e.is_transient() => {
                warn!(error = %e, "Demand refresh failed, keeping previous state");
                None
            }
            Err(e) => {
                error!(error = %e, "Demand refresh returned unusable data, keeping previous state");
                None
            }
        }
    }

    async fn try_refresh(&self, seed: Vec<NodeRecord>) -> PoolResult<DemandSnapshot> {
        let (live_sessions, demand) =
            tokio::try_join!(self.backend.live_sessions(), self.backend.scene_demand())?;

        let active: Vec<SceneDemandConfig> =
            demand.iter().filter(|s| s.is_active).cloned().collect();
        let active_ids: HashSet<&str> = active.iter().map(|s| s.scene_id.as_str()).collect();
        let keep = |node: &NodeRecord| {
            active_ids.contains(node.scene_id.as_str())
                && live_sessions.contains_key(&node.engine_id)
        };

        self.registry.set_demand(active.clone()).await;

        if seed.is_empty() {
            self.registry.update(|nodes| nodes.retain(keep)).await;
        } else {
            let seed_count = seed.len();
            let filtered: Vec<NodeRecord> = seed.into_iter().filter(|n| keep(n)).collect();
            info!(
                seed_count,
                kept = filtered.len(),
                "Seeded registry from snapshot"
            );
            self.registry.set(filtered).await;
        }

        debug!(
            live_sessions = live_sessions.len(),
            active_scenes = active.len(),
            "Demand refreshed"
        );

        Ok(DemandSnapshot {
            live_sessions,
            demand,
        })
    }

    /// Admit a session the reconciler just opened for `scene`.
    ///
    /// Change events are suppressed while the merged view is refreshed and the
    /// record appended, so the refresh itself does not trigger another pass.
    pub async fn admit_created(
        &self,
        session: SessionHandle,
        scene: &SceneDemandConfig,
    ) -> AdmitOutcome {
        let _pause = self.registry.pause_notifications();
        let snapshot = self.refresh(Vec::new()).await;

        let engine_id = session.engine_id().to_string();
        if self
            .registry
            .get()
            .await
            .iter()
            .any(|n| n.engine_id == engine_id)
        {
            return AdmitOutcome::AlreadyTracked;
        }

        // Without a fresh view, trust the config the decision was made with.
        let (scene_config, live) = match &snapshot {
            Some(snapshot) => match snapshot.active_scene(&scene.scene_id) {
                Some(config) => (config, snapshot.live_sessions.get(&engine_id)),
                None => return AdmitOutcome::SceneInactive(session),
            },
            None => (scene, None),
        };

        let record = NodeRecord::created(session, scene_config, live);
        self.registry
            .update(|nodes| nodes.push(record.clone()))
            .await;

        info!(
            engine_id = %record.engine_id,
            scene_id = %record.scene_id,
            "Node admitted"
        );
        AdmitOutcome::Added(record)
    }

    /// Poll until shutdown.
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_ms = self.interval.as_millis() as u64,
            "Starting demand fetcher"
        );

        let mut interval = tokio::time::interval(self.interval);
        // Startup already refreshed once
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.refresh(Vec::new()).await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Demand fetcher shutting down");
                        break;
                    }
                }
            }
        }
    }
}
