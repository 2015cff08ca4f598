//! Render service and management API client.
//!
//! Provides the external datasets the pool reconciles against:
//! - Live sessions, from the render service (`/sessions`)
//! - Per-scene demand configuration, from the management API
//! - Session teardown by engine id (`/kill`)

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, error, warn};

use crate::config::Config;
use crate::error::{PoolError, PoolResult};
use crate::model::{LiveSession, LiveSessionSet, SceneDemandConfig};

/// Source of live-session and demand state.
#[async_trait]
pub trait RenderBackend: Send + Sync {
    /// Sessions currently alive on the render service, keyed by engine id.
    async fn live_sessions(&self) -> PoolResult<LiveSessionSet>;

    /// Demand configuration for every known scene, active or not.
    async fn scene_demand(&self) -> PoolResult<Vec<SceneDemandConfig>>;

    /// Ask the render service to terminate a session.
    async fn kill_session(&self, engine_id: &str) -> PoolResult<()>;
}

/// HTTP implementation of [`RenderBackend`].
pub struct HttpRenderBackend {
    client: reqwest::Client,
    cloud_server_url: String,
    demand_url: String,
}

impl HttpRenderBackend {
    pub fn new(config: &Config) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .unwrap_or_else(|e| {
                warn!(error = %e, "Failed to build HTTP client, using defaults");
                reqwest::Client::new()
            });

        Self {
            client,
            cloud_server_url: config.cloud_server_url.trim_end_matches('/').to_string(),
            demand_url: format!(
                "{}{}",
                config.management_url.trim_end_matches('/'),
                config.demand_path
            ),
        }
    }

    async fn get_json(&self, url: &str, query: &[(&str, String)]) -> PoolResult<Value> {
        let response = self.client.get(url).query(query).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!(url = %url, status = %status, body = %body, "Render backend request failed");
            return Err(PoolError::UnexpectedStatus {
                endpoint: url.to_string(),
                status: status.as_u16(),
            });
        }

        Ok(response.json().await?)
    }
}

#[async_trait]
impl RenderBackend for HttpRenderBackend {
    async fn live_sessions(&self) -> PoolResult<LiveSessionSet> {
        let url = format!("{}/sessions", self.cloud_server_url);
        let stamp = chrono::Utc::now().timestamp_millis().to_string();
        let body = self.get_json(&url, &[("t", stamp)]).await?;

        let Value::Object(entries) = body else {
            return Err(PoolError::unexpected_payload(url, "expected a session map"));
        };

        let mut sessions = LiveSessionSet::new();
        for (engine_id, raw) in entries {
            match serde_json::from_value::<LiveSession>(raw) {
                Ok(session) => {
                    sessions.insert(engine_id, session);
                }
                Err(e) => {
                    warn!(engine_id = %engine_id, error = %e, "Skipping malformed session entry");
                }
            }
        }

        debug!(session_count = sessions.len(), "Fetched live sessions");
        Ok(sessions)
    }

    async fn scene_demand(&self) -> PoolResult<Vec<SceneDemandConfig>> {
        let body = self.get_json(&self.demand_url, &[]).await?;

        let Value::Array(items) = body else {
            return Err(PoolError::unexpected_payload(
                &self.demand_url,
                "expected a scene list",
            ));
        };

        let mut scenes = Vec::with_capacity(items.len());
        for raw in items {
            match serde_json::from_value::<SceneDemandConfig>(raw) {
                Ok(scene) => scenes.push(scene),
                Err(e) => warn!(error = %e, "Skipping malformed scene demand entry"),
            }
        }

        debug!(scene_count = scenes.len(), "Fetched scene demand");
        Ok(scenes)
    }

    async fn kill_session(&self, engine_id: &str) -> PoolResult<()> {
        if engine_id.is_empty() {
            return Err(PoolError::Session("empty engine id".to_string()));
        }

        let url = format!("{}/kill", self.cloud_server_url);
        debug!(engine_id = %engine_id, "Killing session");

        let response = self
            .client
            .get(&url)
            .query(&[("id", engine_id)])
            .timeout(Duration::from_secs(5))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(PoolError::UnexpectedStatus {
                endpoint: url,
                status: response.status().as_u16(),
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const DEMAND_PATH: &str = "/api/cloud-render-management/cloud-render-nodeses/get-list-async-allow-anonymous";

    fn backend_for(server: &MockServer) -> HttpRenderBackend {
        let config = Config {
            cloud_server_url: server.uri(),
            management_url: server.uri(),
            demand_path: DEMAND_PATH.to_string(),
            ..Config::default()
        };
        HttpRenderBackend::new(&config)
    }

    #[tokio::test]
    async fn test_live_sessions() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/sessions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "e1": {"clients": {"c1": {}}},
                "e2": {"clients": {}, "region": "eu"}
            })))
            .mount(&server)
            .await;

        let sessions = backend_for(&server).live_sessions().await.unwrap();
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions["e1"].client_count(), 1);
        assert_eq!(sessions["e2"].client_count(), 0);
        assert_eq!(sessions["e2"].extra["region"], "eu");
    }

    #[tokio::test]
    async fn test_live_sessions_rejects_non_object() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/sessions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!(["e1"])))
            .mount(&server)
            .await;

        let err = backend_for(&server).live_sessions().await.unwrap_err();
        assert!(matches!(err, PoolError::UnexpectedPayload { .. }));
    }

    #[tokio::test]
    async fn test_scene_demand_skips_malformed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(DEMAND_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"sceneId": "S1", "preloadedMinNodes": 2, "preloadedMaxNodes": 5, "freeTimeNodes": 1, "isActive": true},
                {"noSceneId": true},
                {"sceneId": "S2", "isActive": false}
            ])))
            .mount(&server)
            .await;

        let scenes = backend_for(&server).scene_demand().await.unwrap();
        assert_eq!(scenes.len(), 2);
        assert_eq!(scenes[0].scene_id, "S1");
        assert_eq!(scenes[0].max_nodes, 5);
        assert!(!scenes[1].is_active);
    }

    #[tokio::test]
    async fn test_scene_demand_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(DEMAND_PATH))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;

        let err = backend_for(&server).scene_demand().await.unwrap_err();
        assert!(matches!(err, PoolError::UnexpectedStatus { status: 502, .. }));
    }

    #[tokio::test]
    async fn test_kill_session() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/kill"))
            .and(query_param("id", "e1"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let backend = backend_for(&server);
        backend.kill_session("e1").await.unwrap();
        assert!(backend.kill_session("").await.is_err());
    }
}
