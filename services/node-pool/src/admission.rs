//! Node admission.
//!
//! Hands idle nodes to callers. A claim is a single registry update, so two
//! concurrent claims for the last idle node of a scene never both succeed.

use std::str::FromStr;
use std::sync::Arc;

use tokio::sync::{broadcast, watch};
use tracing::{debug, info, instrument, warn};

use crate::model::NodeProjection;
use crate::notifier::PoolEvent;
use crate::registry::NodeRegistry;

/// Which nodes a listing covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SceneFilter {
    All,
    Scene(String),
}

impl FromStr for SceneFilter {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "all" => Self::All,
            id => Self::Scene(id.to_string()),
        })
    }
}

/// Claims and lists nodes.
#[derive(Clone)]
pub struct Admission {
    registry: Arc<NodeRegistry>,
}

impl Admission {
    pub fn new(registry: Arc<NodeRegistry>) -> Self {
        Self { registry }
    }

    /// Claim the first idle node of `scene_id` for `claimant`.
    ///
    /// `None` means no idle node is available, which is an ordinary outcome.
    pub async fn distribute(
        &self,
        scene_id: Option<&str>,
        claimant: Option<&str>,
    ) -> Option<NodeProjection> {
        let scene_id = scene_id?;

        let claimed = self
            .registry
            .try_update(|nodes| {
                let node = nodes
                    .iter_mut()
                    .find(|n| n.is_idle() && n.scene_id == scene_id)?;
                node.is_distributed = true;
                node.true_name = claimant.map(str::to_string);
                Some(node.projection())
            })
            .await;

        match &claimed {
            Some(node) => info!(
                engine_id = %node.engine_id,
                scene_id,
                claimant = claimant.unwrap_or_default(),
                "Node distributed"
            ),
            None => debug!(scene_id, "No idle node available"),
        }
        claimed
    }

    /// All nodes, or those of one scene, in registry order.
    pub async fn list_by_scene(&self, filter: &SceneFilter) -> Vec<NodeProjection> {
        self.registry
            .get()
            .await
            .iter()
            .filter(|n| match filter {
                SceneFilter::All => true,
                SceneFilter::Scene(id) => &n.scene_id == id,
            })
            .map(|n| n.projection())
            .collect()
    }

    /// Log nodes as they become available until shutdown.
    #[instrument(skip(self, events, shutdown))]
    pub async fn run(
        &self,
        mut events: broadcast::Receiver<PoolEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(PoolEvent::NodeAdded(node)) => {
                        info!(
                            engine_id = %node.engine_id,
                            scene_id = %node.scene_id,
                            "Node available for distribution"
                        );
                    }
                    Ok(PoolEvent::RegistryChanged { .. }) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Admission listener lagged behind pool events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }
}
