//! Application state shared across request handlers.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::admission::Admission;
use crate::registry::NodeRegistry;

/// Shared application state.
///
/// This is passed to all request handlers via Axum's state extractor.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    admission: Admission,
    registry: Arc<NodeRegistry>,
    public_dir: PathBuf,
}

impl AppState {
    pub fn new(registry: Arc<NodeRegistry>, public_dir: PathBuf) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                admission: Admission::new(Arc::clone(&registry)),
                registry,
                public_dir,
            }),
        }
    }

    pub fn admission(&self) -> &Admission {
        &self.inner.admission
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.inner.registry
    }

    /// Directory served as static files.
    pub fn public_dir(&self) -> &Path {
        &self.inner.public_dir
    }
}
