//! Render node pool
//!
//! Keeps a warm pool of render sessions per scene, matched to the demand
//! configured in the management API, and hands idle sessions to callers.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use renderpool_node_pool::{
    api,
    backend::{HttpRenderBackend, RenderBackend},
    config::{BackendMode, Config},
    model::SceneDemandConfig,
    persistence::{FileSnapshotStore, SnapshotStore},
    pool::{NodePool, PoolTiming},
    session::{DetachedLauncher, SessionLauncher, SimulatedRenderService},
    state::AppState,
};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to RENDERPOOL_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting render node pool");
    info!(
        listen_addr = %config.listen_addr,
        backend = ?config.backend,
        snapshot = %config.snapshot_path().display(),
        "Configuration loaded"
    );

    let (backend, launcher) = build_backend(&config)?;

    let store = Arc::new(FileSnapshotStore::new(config.snapshot_path()));
    if let Err(e) = store.ensure_initialized().await {
        warn!(error = %e, "Failed to initialize snapshot directory");
    }
    let store: Arc<dyn SnapshotStore> = store;

    let pool = NodePool::new(
        backend,
        launcher,
        store,
        PoolTiming {
            debounce_delay: config.debounce_delay,
            poll_interval: config.poll_interval,
        },
    );

    // Subscribe before the startup refresh emits its first change
    let reconciler_events = pool.registry.subscribe();
    let admission_events = pool.registry.subscribe();

    pool.start().await;

    // Create shutdown channel for graceful shutdown
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let fetcher_handle = tokio::spawn({
        let fetcher = Arc::clone(&pool.fetcher);
        let shutdown_rx = shutdown_rx.clone();
        async move {
            fetcher.run(shutdown_rx).await;
        }
    });

    let reconciler_handle = tokio::spawn(
        Arc::clone(&pool.reconciler).run(reconciler_events, shutdown_rx.clone()),
    );

    let state = AppState::new(Arc::clone(&pool.registry), config.public_dir.clone());

    let admission_handle = tokio::spawn({
        let admission = state.admission().clone();
        let shutdown_rx = shutdown_rx.clone();
        async move {
            admission.run(admission_events, shutdown_rx).await;
        }
    });

    // Build and run the server
    let app = api::create_router(state);

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!(addr = %config.listen_addr, "Listening for connections");

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let mut shutdown_rx = shutdown_rx;
                loop {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                    if shutdown_rx.changed().await.is_err() {
                        break;
                    }
                }
                info!("HTTP server shutting down");
            })
            .await
    });

    // Wait for shutdown signal (Ctrl+C)
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = server_handle => {
            match result {
                Ok(Ok(())) => info!("Server exited normally"),
                Ok(Err(e)) => error!(error = %e, "Server error"),
                Err(e) => error!(error = %e, "Server task panicked"),
            }
        }
    }

    // Signal shutdown to all workers
    let _ = shutdown_tx.send(true);

    info!("Waiting for workers to shut down...");
    let shutdown_timeout = Duration::from_secs(10);

    if let Err(e) = tokio::time::timeout(shutdown_timeout, fetcher_handle).await {
        warn!(error = %e, "Demand fetcher did not shut down in time");
    }

    if let Err(e) = tokio::time::timeout(shutdown_timeout, reconciler_handle).await {
        warn!(error = %e, "Pool reconciler did not shut down in time");
    }

    if let Err(e) = tokio::time::timeout(shutdown_timeout, admission_handle).await {
        warn!(error = %e, "Admission listener did not shut down in time");
    }

    info!("Node pool shutdown complete");
    Ok(())
}

fn build_backend(config: &Config) -> Result<(Arc<dyn RenderBackend>, Arc<dyn SessionLauncher>)> {
    match config.backend {
        BackendMode::Simulated => {
            let demand = match &config.simulated_demand_file {
                Some(path) => load_demand_file(path)?,
                None => Vec::new(),
            };
            info!(scene_count = demand.len(), "Using simulated render service");

            let service = Arc::new(
                SimulatedRenderService::with_demand(demand)
                    .with_launch_delay(Duration::from_millis(200)),
            );
            let backend: Arc<dyn RenderBackend> = service.clone();
            let launcher: Arc<dyn SessionLauncher> = service;
            Ok((backend, launcher))
        }
        BackendMode::Http => {
            warn!("No session transport is linked in, running admission only");
            let backend: Arc<dyn RenderBackend> = Arc::new(HttpRenderBackend::new(config));
            let launcher: Arc<dyn SessionLauncher> = Arc::new(DetachedLauncher);
            Ok((backend, launcher))
        }
    }
}

fn load_demand_file(path: &Path) -> Result<Vec<SceneDemandConfig>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read demand file {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("Failed to parse demand file {}", path.display()))
}
