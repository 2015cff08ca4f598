//! Startup orphan sweep.
//!
//! Sessions the render service reports with no attached client are left over
//! from a previous run and nobody will ever connect to them. They are killed
//! one at a time, before the polling loop starts.

use std::sync::Arc;

use tracing::{info, warn};

use crate::backend::RenderBackend;
use crate::model::NodeRecord;
use crate::session::SessionLauncher;

/// Counters from one sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    /// Sessions with no attached client.
    pub candidates: usize,

    /// Killed through the render service.
    pub killed: usize,

    /// Closed through a held session handle after the kill call failed.
    pub fallback_destroyed: usize,

    pub failed: usize,
}

pub struct OrphanSweeper {
    backend: Arc<dyn RenderBackend>,
    launcher: Arc<dyn SessionLauncher>,
}

impl OrphanSweeper {
    pub fn new(backend: Arc<dyn RenderBackend>, launcher: Arc<dyn SessionLauncher>) -> Self {
        Self { backend, launcher }
    }

    /// Kill every live session without clients.
    ///
    /// `seed` is the persisted node list; when a kill fails, a matching seed
    /// record holding a session handle is closed through it instead.
    pub async fn sweep(&self, seed: &[NodeRecord]) -> SweepReport {
        let mut report = SweepReport::default();

        let live = match self.backend.live_sessions().await {
            Ok(live) => live,
            Err(e) => {
                warn!(error = %e, "Failed to list sessions, skipping orphan sweep");
                return report;
            }
        };

        let mut empty: Vec<String> = live
            .into_iter()
            .filter(|(_, session)| session.client_count() == 0)
            .map(|(engine_id, _)| engine_id)
            .collect();
        report.candidates = empty.len();

        while let Some(engine_id) = empty.pop() {
            match self.backend.kill_session(&engine_id).await {
                Ok(()) => {
                    report.killed += 1;
                    continue;
                }
                Err(e) => warn!(engine_id = %engine_id, error = %e, "Failed to kill orphaned session"),
            }

            let handle = seed
                .iter()
                .find(|n| n.engine_id == engine_id)
                .and_then(|n| n.session.as_ref());
            match handle {
                Some(handle) => match self.launcher.destroy(handle).await {
                    Ok(()) => report.fallback_destroyed += 1,
                    Err(e) => {
                        warn!(engine_id = %engine_id, error = %e, "Failed to close orphaned session");
                        report.failed += 1;
                    }
                },
                None => report.failed += 1,
            }
        }

        if report.candidates > 0 {
            info!(
                candidates = report.candidates,
                killed = report.killed,
                fallback_destroyed = report.fallback_destroyed,
                failed = report.failed,
                "Orphan sweep complete"
            );
        }
        report
    }
}
