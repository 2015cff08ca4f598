//! HTTP surface tests, driven through the router without a listener.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use renderpool_node_pool::api::create_router;
use renderpool_node_pool::model::{NodeRecord, SceneDemandConfig};
use renderpool_node_pool::notifier::ChangeNotifier;
use renderpool_node_pool::persistence::MemorySnapshotStore;
use renderpool_node_pool::registry::NodeRegistry;
use renderpool_node_pool::session::SessionHandle;
use renderpool_node_pool::state::AppState;
use serde_json::{json, Value};
use tower::ServiceExt;

fn scene(id: &str) -> SceneDemandConfig {
    serde_json::from_value(json!({
        "sceneId": id,
        "preloadedMinNodes": 1,
        "preloadedMaxNodes": 2,
        "freeTimeNodes": 1,
        "isActive": true,
        "sceneName": "harbour"
    }))
    .unwrap()
}

fn created(engine_id: &str, scene_id: &str) -> NodeRecord {
    NodeRecord::created(
        SessionHandle::new(engine_id, format!("token-{engine_id}")),
        &scene(scene_id),
        None,
    )
}

async fn setup(nodes: Vec<NodeRecord>, public_dir: &Path) -> (Router, Arc<NodeRegistry>) {
    let notifier = ChangeNotifier::spawn(
        Duration::from_millis(50),
        Arc::new(MemorySnapshotStore::new()),
    );
    let registry = Arc::new(NodeRegistry::new(notifier));
    registry.set(nodes).await;
    let router = create_router(AppState::new(Arc::clone(&registry), public_dir.to_path_buf()));
    (router, registry)
}

async fn get(router: &Router, uri: &str) -> (StatusCode, Value) {
    let response = router
        .clone()
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

#[tokio::test]
async fn test_distribute_node_then_empty() {
    let dir = tempfile::tempdir().unwrap();
    let (router, registry) = setup(vec![created("e1", "S1")], dir.path()).await;

    let (status, body) = get(
        &router,
        "/api/cloud-render-node/distribute-node?sceneId=S1&trueName=alice",
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["code"], 200);
    assert_eq!(body["message"], "node distributed");
    assert_eq!(body["data"]["engineId"], "e1");
    assert_eq!(body["data"]["isDistributed"], true);
    assert_eq!(body["data"]["trueName"], "alice");
    assert_eq!(body["data"]["sceneName"], "harbour");
    assert!(body["data"].get("session").is_none());

    let (status, body) = get(
        &router,
        "/api/cloud-render-node/distribute-node?sceneId=S1&trueName=bob",
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["code"], 200);
    assert_eq!(body["message"], "no node available");
    assert_eq!(body["data"], json!({}));

    assert_eq!(
        registry.get().await[0].true_name.as_deref(),
        Some("alice")
    );
}

#[tokio::test]
async fn test_distribute_without_scene_id() {
    let dir = tempfile::tempdir().unwrap();
    let (router, registry) = setup(vec![created("e1", "S1")], dir.path()).await;

    let (status, body) = get(&router, "/api/cloud-render-node/distribute-node").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"], json!({}));
    assert!(registry.get().await[0].is_idle());
}

#[tokio::test]
async fn test_scene_distribute_list() {
    let dir = tempfile::tempdir().unwrap();
    let (router, _registry) = setup(
        vec![created("e1", "S1"), created("e2", "S2"), created("e3", "S1")],
        dir.path(),
    )
    .await;

    let (status, body) = get(&router, "/api/cloud-render-node/get-scene-distribute-list/all").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"], "query succeeded");
    assert_eq!(body["data"].as_array().unwrap().len(), 3);

    let (_, body) = get(&router, "/api/cloud-render-node/get-scene-distribute-list/S1").await;
    let ids: Vec<&str> = body["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|n| n["engineId"].as_str().unwrap())
        .collect();
    assert_eq!(ids, vec!["e1", "e3"]);

    let (_, body) = get(&router, "/api/cloud-render-node/get-scene-distribute-list/S9").await;
    assert_eq!(body["data"], json!([]));
}

#[tokio::test]
async fn test_scene_distribute_list_without_id() {
    let dir = tempfile::tempdir().unwrap();
    let (router, _registry) = setup(vec![created("e1", "S1")], dir.path()).await;

    for uri in [
        "/api/cloud-render-node/get-scene-distribute-list",
        "/api/cloud-render-node/get-scene-distribute-list/",
    ] {
        let (status, body) = get(&router, uri).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            body,
            json!({"code": 200, "message": "must supply scene id", "data": []})
        );
    }
}

#[tokio::test]
async fn test_readyz_follows_demand() {
    let dir = tempfile::tempdir().unwrap();
    let (router, registry) = setup(Vec::new(), dir.path()).await;

    let (status, body) = get(&router, "/readyz").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["status"], "degraded");

    registry.set_demand(vec![scene("S1")]).await;
    let (status, body) = get(&router, "/readyz").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["pool"]["scenes"], 1);

    let (status, body) = get(&router, "/healthz").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["service"], "node-pool");
}

#[tokio::test]
async fn test_public_dir_is_served() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("cloudRenderData")).unwrap();
    std::fs::write(
        dir.path().join("cloudRenderData").join("cacheRenderData.json"),
        r#"[{"engineId":"e1","sceneId":"S1"}]"#,
    )
    .unwrap();
    let (router, _registry) = setup(Vec::new(), dir.path()).await;

    let (status, body) = get(&router, "/cloudRenderData/cacheRenderData.json").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body[0]["engineId"], "e1");

    let (status, _) = get(&router, "/missing.json").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_cors_allows_any_origin() {
    let dir = tempfile::tempdir().unwrap();
    let (router, _registry) = setup(Vec::new(), dir.path()).await;

    let response = router
        .oneshot(
            Request::builder()
                .uri("/api/cloud-render-node/get-scene-distribute-list/all")
                .header(header::ORIGIN, "http://viewer.example")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(
        response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN],
        "*"
    );
}
