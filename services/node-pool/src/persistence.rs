//! Node snapshot persistence.
//!
//! The last known node list is written to disk after every debounced registry
//! change and read back once at startup as the seed for the first refresh.
//! Durability is best-effort: the in-memory registry is the source of truth
//! and is rebuilt from the render service on every poll.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{PoolError, PoolResult};
use crate::model::NodeRecord;

/// Storage for the node snapshot.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Read the last saved node list.
    async fn load(&self) -> PoolResult<Vec<NodeRecord>>;

    /// Replace the saved node list.
    async fn save(&self, nodes: &[NodeRecord]) -> PoolResult<()>;
}

/// JSON file snapshot store.
pub struct FileSnapshotStore {
    path: PathBuf,
}

impl FileSnapshotStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create the snapshot directory and an empty snapshot if either is missing.
    pub async fn ensure_initialized(&self) -> PoolResult<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| {
                PoolError::Persistence(format!("failed to create {}: {e}", parent.display()))
            })?;
        }

        if !fs::try_exists(&self.path).await? {
            fs::write(&self.path, b"[]").await.map_err(|e| {
                PoolError::Persistence(format!("failed to create {}: {e}", self.path.display()))
            })?;
            info!(path = %self.path.display(), "Created empty node snapshot");
        }

        Ok(())
    }
}

#[async_trait]
impl SnapshotStore for FileSnapshotStore {
    async fn load(&self) -> PoolResult<Vec<NodeRecord>> {
        self.ensure_initialized().await?;

        let content = fs::read_to_string(&self.path).await.map_err(|e| {
            PoolError::Persistence(format!("failed to read {}: {e}", self.path.display()))
        })?;

        let nodes: Vec<NodeRecord> = serde_json::from_str(&content).map_err(|e| {
            PoolError::Persistence(format!("failed to parse {}: {e}", self.path.display()))
        })?;

        info!(
            path = %self.path.display(),
            node_count = nodes.len(),
            "Loaded node snapshot"
        );
        Ok(nodes)
    }

    /// Write-to-temp + rename, so a crash never leaves a truncated snapshot.
    async fn save(&self, nodes: &[NodeRecord]) -> PoolResult<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let content = serde_json::to_vec(nodes)?;
        let tmp_path = self.path.with_extension("tmp");

        fs::write(&tmp_path, &content).await.map_err(|e| {
            PoolError::Persistence(format!("failed to write {}: {e}", tmp_path.display()))
        })?;
        fs::rename(&tmp_path, &self.path).await.map_err(|e| {
            PoolError::Persistence(format!(
                "failed to rename {} -> {}: {e}",
                tmp_path.display(),
                self.path.display()
            ))
        })?;

        debug!(
            path = %self.path.display(),
            node_count = nodes.len(),
            "Saved node snapshot"
        );
        Ok(())
    }
}

/// In-memory snapshot store. Records every save.
#[derive(Default)]
pub struct MemorySnapshotStore {
    initial: Vec<NodeRecord>,
    saves: Mutex<Vec<Vec<NodeRecord>>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_initial(initial: Vec<NodeRecord>) -> Self {
        Self {
            initial,
            saves: Mutex::new(Vec::new()),
        }
    }

    pub async fn save_count(&self) -> usize {
        self.saves.lock().await.len()
    }

    pub async fn last_saved(&self) -> Option<Vec<NodeRecord>> {
        self.saves.lock().await.last().cloned()
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn load(&self) -> PoolResult<Vec<NodeRecord>> {
        Ok(self.initial.clone())
    }

    async fn save(&self, nodes: &[NodeRecord]) -> PoolResult<()> {
        self.saves.lock().await.push(nodes.to_vec());
        Ok(())
    }
}

/// Load the startup seed, falling back to an empty list.
pub async fn load_seed(store: &dyn SnapshotStore) -> Vec<NodeRecord> {
    match store.load().await {
        Ok(nodes) => nodes,
        Err(e) => {
            warn!(error = %e, "Failed to load node snapshot, starting empty");
            Vec::new()
        }
    }
}
