//! Render session lifecycle interface and simulated implementation.
//!
//! The session transport (signalling, video/control channels, scene loading)
//! lives outside the pool. The pool only needs to:
//! - Open a session for a scene and get back an opaque handle
//! - Close a session through that handle
//!
//! [`SimulatedRenderService`] plays both the session transport and the render
//! service backend in-process, for development and tests. [`DetachedLauncher`]
//! stands in when only the render service backend is reachable.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::backend::RenderBackend;
use crate::error::{PoolError, PoolResult};
use crate::model::{LiveSession, LiveSessionSet, SceneDemandConfig};

/// Opaque handle to an open render session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionHandle {
    engine_id: String,
    token: String,
}

impl SessionHandle {
    pub fn new(engine_id: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            engine_id: engine_id.into(),
            token: token.into(),
        }
    }

    /// Engine id the render service knows this session by.
    pub fn engine_id(&self) -> &str {
        &self.engine_id
    }

    /// Transport-specific token identifying this particular launch.
    pub fn token(&self) -> &str {
        &self.token
    }
}

/// Session lifecycle interface.
#[async_trait]
pub trait SessionLauncher: Send + Sync {
    /// Open a session for the given scene.
    async fn create(&self, scene: &SceneDemandConfig) -> PoolResult<SessionHandle>;

    /// Close a session.
    async fn destroy(&self, handle: &SessionHandle) -> PoolResult<()>;
}

/// Launcher for deployments with no session transport linked in.
///
/// Every create fails, so the reconciler never opens sessions the render
/// service cannot see. The pool still admits and lists the nodes it finds.
#[derive(Debug, Default, Clone, Copy)]
pub struct DetachedLauncher;

#[async_trait]
impl SessionLauncher for DetachedLauncher {
    async fn create(&self, scene: &SceneDemandConfig) -> PoolResult<SessionHandle> {
        Err(PoolError::Session(format!(
            "no session transport linked in, cannot open a session for scene {}",
            scene.scene_id
        )))
    }

    async fn destroy(&self, handle: &SessionHandle) -> PoolResult<()> {
        Err(PoolError::Session(format!(
            "no session transport linked in, cannot close session {}",
            handle.engine_id()
        )))
    }
}

/// Client id the pool registers under when it opens a session.
const POOL_CLIENT_ID: &str = "node-pool";

/// In-process render service.
///
/// Sessions opened through [`SessionLauncher::create`] are immediately
/// reported live with one attached client (the pool itself).
pub struct SimulatedRenderService {
    sessions: Mutex<LiveSessionSet>,
    demand: Mutex<Vec<SceneDemandConfig>>,
    launch_delay: Duration,
    launch_counter: AtomicU64,
    destroyed: AtomicU64,
    killed: AtomicU64,
    fail_creates: AtomicBool,
    fail_kills: AtomicBool,
    fail_fetches: AtomicBool,
}

impl SimulatedRenderService {
    pub fn new() -> Self {
        Self::with_demand(Vec::new())
    }

    pub fn with_demand(demand: Vec<SceneDemandConfig>) -> Self {
        Self {
            sessions: Mutex::new(LiveSessionSet::new()),
            demand: Mutex::new(demand),
            launch_delay: Duration::ZERO,
            launch_counter: AtomicU64::new(0),
            destroyed: AtomicU64::new(0),
            killed: AtomicU64::new(0),
            fail_creates: AtomicBool::new(false),
            fail_kills: AtomicBool::new(false),
            fail_fetches: AtomicBool::new(false),
        }
    }

    /// Delay every session launch, to mimic engine start-up time.
    pub fn with_launch_delay(mut self, delay: Duration) -> Self {
        self.launch_delay = delay;
        self
    }

    pub async fn set_demand(&self, demand: Vec<SceneDemandConfig>) {
        *self.demand.lock().await = demand;
    }

    pub fn set_fail_creates(&self, fail: bool) {
        self.fail_creates.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_kills(&self, fail: bool) {
        self.fail_kills.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_fetches(&self, fail: bool) {
        self.fail_fetches.store(fail, Ordering::SeqCst);
    }

    /// Register a session that was not opened by the pool.
    pub async fn insert_session(&self, engine_id: &str, client_count: usize) {
        let clients: Map<String, Value> = (0..client_count)
            .map(|i| (format!("client-{i}"), json!({})))
            .collect();
        self.sessions.lock().await.insert(
            engine_id.to_string(),
            LiveSession {
                clients: Value::Object(clients),
                extra: Map::new(),
            },
        );
    }

    pub async fn has_session(&self, engine_id: &str) -> bool {
        self.sessions.lock().await.contains_key(engine_id)
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub fn created_count(&self) -> u64 {
        self.launch_counter.load(Ordering::SeqCst)
    }

    pub fn destroyed_count(&self) -> u64 {
        self.destroyed.load(Ordering::SeqCst)
    }

    pub fn killed_count(&self) -> u64 {
        self.killed.load(Ordering::SeqCst)
    }

    fn check_fetch(&self, endpoint: &str) -> PoolResult<()> {
        if self.fail_fetches.load(Ordering::SeqCst) {
            return Err(PoolError::UnexpectedStatus {
                endpoint: endpoint.to_string(),
                status: 503,
            });
        }
        Ok(())
    }
}

impl Default for SimulatedRenderService {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionLauncher for SimulatedRenderService {
    async fn create(&self, scene: &SceneDemandConfig) -> PoolResult<SessionHandle> {
        if self.fail_creates.load(Ordering::SeqCst) {
            return Err(PoolError::Session(
                "simulated render service configured to fail".to_string(),
            ));
        }

        if !self.launch_delay.is_zero() {
            tokio::time::sleep(self.launch_delay).await;
        }

        let launch = self.launch_counter.fetch_add(1, Ordering::SeqCst);
        let engine_id = Uuid::new_v4().to_string();
        let mut extra = Map::new();
        extra.insert("launchedFor".to_string(), json!(scene.scene_id));
        extra.insert("launchedAt".to_string(), json!(chrono::Utc::now().to_rfc3339()));

        self.sessions.lock().await.insert(
            engine_id.clone(),
            LiveSession {
                clients: json!({ POOL_CLIENT_ID: {} }),
                extra,
            },
        );

        info!(engine_id = %engine_id, scene_id = %scene.scene_id, "[SIM] Session opened");
        Ok(SessionHandle::new(engine_id, format!("sim_{launch:08x}")))
    }

    async fn destroy(&self, handle: &SessionHandle) -> PoolResult<()> {
        let removed = self.sessions.lock().await.remove(handle.engine_id());
        if removed.is_none() {
            return Err(PoolError::Session(format!(
                "unknown session {}",
                handle.engine_id()
            )));
        }

        self.destroyed.fetch_add(1, Ordering::SeqCst);
        debug!(engine_id = %handle.engine_id(), "[SIM] Session closed");
        Ok(())
    }
}

#[async_trait]
impl RenderBackend for SimulatedRenderService {
    async fn live_sessions(&self) -> PoolResult<LiveSessionSet> {
        self.check_fetch("/sessions")?;
        Ok(self.sessions.lock().await.clone())
    }

    async fn scene_demand(&self) -> PoolResult<Vec<SceneDemandConfig>> {
        self.check_fetch("/get-list-async-allow-anonymous")?;
        Ok(self.demand.lock().await.clone())
    }

    async fn kill_session(&self, engine_id: &str) -> PoolResult<()> {
        if self.fail_kills.load(Ordering::SeqCst) {
            return Err(PoolError::UnexpectedStatus {
                endpoint: "/kill".to_string(),
                status: 500,
            });
        }

        self.sessions.lock().await.remove(engine_id);
        self.killed.fetch_add(1, Ordering::SeqCst);
        debug!(engine_id = %engine_id, "[SIM] Session killed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scene(id: &str) -> SceneDemandConfig {
        serde_json::from_value(json!({
            "sceneId": id,
            "minNodes": 1,
            "maxNodes": 2,
            "idleNodes": 1,
            "isActive": true
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_simulated_create_registers_live_session() {
        let service = SimulatedRenderService::new();
        let handle = service.create(&scene("S1")).await.unwrap();

        let live = service.live_sessions().await.unwrap();
        let session = &live[handle.engine_id()];
        assert_eq!(session.client_count(), 1);
        assert_eq!(session.extra["launchedFor"], "S1");
        assert_eq!(service.created_count(), 1);
    }

    #[tokio::test]
    async fn test_simulated_destroy() {
        let service = SimulatedRenderService::new();
        let handle = service.create(&scene("S1")).await.unwrap();

        service.destroy(&handle).await.unwrap();
        assert!(!service.has_session(handle.engine_id()).await);
        assert_eq!(service.destroyed_count(), 1);

        // A second close of the same handle is reported
        assert!(service.destroy(&handle).await.is_err());
    }

    #[tokio::test]
    async fn test_simulated_failures() {
        let service = SimulatedRenderService::new();

        service.set_fail_creates(true);
        assert!(service.create(&scene("S1")).await.is_err());

        service.set_fail_fetches(true);
        assert!(service.live_sessions().await.is_err());
        assert!(service.scene_demand().await.is_err());

        service.insert_session("orphan", 0).await;
        service.set_fail_kills(true);
        assert!(service.kill_session("orphan").await.is_err());
        assert!(service.has_session("orphan").await);
    }

    #[tokio::test]
    async fn test_detached_launcher_refuses_sessions() {
        let launcher = DetachedLauncher;

        let err = launcher.create(&scene("S1")).await.unwrap_err();
        assert!(matches!(err, PoolError::Session(_)));
        assert!(launcher
            .destroy(&SessionHandle::new("e1", "token"))
            .await
            .is_err());
    }
}
