//! Node pool configuration.
//!
//! Values come from environment variables, optionally layered on top of a
//! JSON settings file in the render deployment's format
//! (`cloudServerHttpPath`, `serveHttpPath`).

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use renderpool_reconcile::{DEFAULT_DEBOUNCE_DELAY, DEFAULT_POLL_INTERVAL};
use serde::Deserialize;

const DEFAULT_DEMAND_PATH: &str =
    "/api/cloud-render-management/cloud-render-nodeses/get-list-async-allow-anonymous";

/// Where live-session and demand state comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendMode {
    /// In-process render service (development).
    Simulated,
    /// Remote render service and management API over HTTP.
    Http,
}

impl std::str::FromStr for BackendMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "simulated" | "sim" => Ok(Self::Simulated),
            "http" => Ok(Self::Http),
            other => anyhow::bail!("unknown backend mode '{other}' (expected simulated or http)"),
        }
    }
}

/// Node pool configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP listen address.
    pub listen_addr: SocketAddr,

    /// Render service base URL (`/sessions`, `/kill`).
    pub cloud_server_url: String,

    /// Management API base URL.
    pub management_url: String,

    /// Path of the scene demand list under the management API.
    pub demand_path: String,

    /// Public data directory; the node snapshot lives below it.
    pub public_dir: PathBuf,

    /// Change notification debounce window.
    pub debounce_delay: Duration,

    /// Demand poll period.
    pub poll_interval: Duration,

    /// Timeout for render service and management API calls.
    pub request_timeout: Duration,

    pub backend: BackendMode,

    /// Demand list served by the simulated backend.
    pub simulated_demand_file: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 3000)),
            cloud_server_url: "http://127.0.0.1:8889".to_string(),
            management_url: "http://127.0.0.1:44311".to_string(),
            demand_path: DEFAULT_DEMAND_PATH.to_string(),
            public_dir: PathBuf::from("./public"),
            debounce_delay: DEFAULT_DEBOUNCE_DELAY,
            poll_interval: DEFAULT_POLL_INTERVAL,
            request_timeout: Duration::from_secs(10),
            backend: BackendMode::Simulated,
            simulated_demand_file: None,
            log_level: "info".to_string(),
        }
    }
}

/// Settings file written by the render deployment tooling.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SettingsFile {
    cloud_server_http_path: Option<String>,
    serve_http_path: Option<String>,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("RENDERPOOL_SETTINGS_FILE") {
            config.apply_settings_file(Path::new(&path))?;
        }

        if let Ok(addr) = std::env::var("RENDERPOOL_LISTEN_ADDR") {
            config.listen_addr = addr
                .parse()
                .context("RENDERPOOL_LISTEN_ADDR must be a socket address (host:port).")?;
        }

        if let Ok(url) = std::env::var("RENDERPOOL_CLOUD_SERVER_URL") {
            config.cloud_server_url = url;
        }

        if let Ok(url) = std::env::var("RENDERPOOL_MANAGEMENT_URL") {
            config.management_url = url;
        }

        if let Ok(path) = std::env::var("RENDERPOOL_DEMAND_PATH") {
            config.demand_path = path;
        }

        if let Ok(dir) = std::env::var("RENDERPOOL_PUBLIC_DIR") {
            config.public_dir = PathBuf::from(dir);
        }

        if let Some(ms) = env_millis("RENDERPOOL_DEBOUNCE_MS")? {
            config.debounce_delay = ms;
        }

        if let Some(ms) = env_millis("RENDERPOOL_POLL_INTERVAL_MS")? {
            config.poll_interval = ms.max(Duration::from_millis(100));
        }

        if let Some(ms) = env_millis("RENDERPOOL_REQUEST_TIMEOUT_MS")? {
            config.request_timeout = ms;
        }

        if let Ok(mode) = std::env::var("RENDERPOOL_BACKEND") {
            config.backend = mode.parse()?;
        }

        config.simulated_demand_file = std::env::var("RENDERPOOL_SIMULATED_DEMAND_FILE")
            .ok()
            .map(PathBuf::from);

        if let Ok(level) = std::env::var("RENDERPOOL_LOG_LEVEL") {
            config.log_level = level;
        }

        Ok(config)
    }

    /// Path of the persisted node snapshot.
    pub fn snapshot_path(&self) -> PathBuf {
        self.public_dir
            .join("cloudRenderData")
            .join("cacheRenderData.json")
    }

    fn apply_settings_file(&mut self, path: &Path) -> Result<()> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings file {}", path.display()))?;
        let settings: SettingsFile = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse settings file {}", path.display()))?;

        if let Some(url) = settings.cloud_server_http_path {
            self.cloud_server_url = url;
        }
        if let Some(url) = settings.serve_http_path {
            self.management_url = url;
        }
        Ok(())
    }
}

fn env_millis(key: &str) -> Result<Option<Duration>> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().parse::<u64>())
        .transpose()
        .with_context(|| format!("{key} must be an integer (milliseconds)."))
        .map(|ms| ms.map(Duration::from_millis))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.debounce_delay, Duration::from_millis(1500));
        assert_eq!(config.poll_interval, Duration::from_millis(2000));
        assert_eq!(config.backend, BackendMode::Simulated);
        assert_eq!(
            config.snapshot_path(),
            PathBuf::from("./public/cloudRenderData/cacheRenderData.json")
        );
    }

    #[test]
    fn test_backend_mode_parse() {
        assert_eq!("http".parse::<BackendMode>().unwrap(), BackendMode::Http);
        assert_eq!(" Simulated ".parse::<BackendMode>().unwrap(), BackendMode::Simulated);
        assert!("grpc".parse::<BackendMode>().is_err());
    }

    #[test]
    fn test_settings_file_overrides_urls() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"cloudServerHttpPath": "http://render:8889", "serveHttpPath": "http://mgmt:44311", "folderName": "demo"}}"#
        )
        .unwrap();

        let mut config = Config::default();
        config.apply_settings_file(file.path()).unwrap();

        assert_eq!(config.cloud_server_url, "http://render:8889");
        assert_eq!(config.management_url, "http://mgmt:44311");
    }

    #[test]
    fn test_settings_file_missing() {
        let mut config = Config::default();
        assert!(config
            .apply_settings_file(Path::new("/nonexistent/settings.json"))
            .is_err());
    }
}
