//! Node distribution endpoints.
//!
//! Every response is HTTP 200 with a `{code, message, data}` envelope; "no
//! node available" is reported in the body, not as an error status.

use axum::{
    extract::{Path, Query, State},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::admission::SceneFilter;
use crate::model::NodeProjection;
use crate::state::AppState;

const MSG_DISTRIBUTED: &str = "node distributed";
const MSG_NO_NODE: &str = "no node available";
const MSG_QUERY_OK: &str = "query succeeded";
const MSG_MISSING_SCENE: &str = "must supply scene id";

/// Create node routes, mounted under `/api`.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/cloud-render-node/distribute-node", get(distribute_node))
        .route(
            "/cloud-render-node/get-scene-distribute-list/{id}",
            get(scene_distribute_list),
        )
        .route(
            "/cloud-render-node/get-scene-distribute-list",
            get(missing_scene_id),
        )
        .route(
            "/cloud-render-node/get-scene-distribute-list/",
            get(missing_scene_id),
        )
}

// =============================================================================
// Request/Response Types
// =============================================================================

/// Response envelope.
#[derive(Debug, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub code: u16,
    pub message: String,
    pub data: T,
}

impl<T> Envelope<T> {
    fn ok(message: &str, data: T) -> Json<Self> {
        Json(Self {
            code: 200,
            message: message.to_string(),
            data,
        })
    }
}

/// Serializes as `{}`.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Empty {}

/// Claimed node, or `{}` when none was available.
#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Distributed {
    Node(NodeProjection),
    Unavailable(Empty),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DistributeQuery {
    pub scene_id: Option<String>,
    pub true_name: Option<String>,
}

// =============================================================================
// Handlers
// =============================================================================

async fn distribute_node(
    State(state): State<AppState>,
    Query(query): Query<DistributeQuery>,
) -> Json<Envelope<Distributed>> {
    let claimed = state
        .admission()
        .distribute(query.scene_id.as_deref(), query.true_name.as_deref())
        .await;

    match claimed {
        Some(node) => Envelope::ok(MSG_DISTRIBUTED, Distributed::Node(node)),
        None => Envelope::ok(MSG_NO_NODE, Distributed::Unavailable(Empty::default())),
    }
}

async fn scene_distribute_list(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Json<Envelope<Vec<NodeProjection>>> {
    let Ok(filter) = id.parse::<SceneFilter>();
    let nodes = state.admission().list_by_scene(&filter).await;
    Envelope::ok(MSG_QUERY_OK, nodes)
}

async fn missing_scene_id() -> Json<Envelope<Vec<NodeProjection>>> {
    Envelope::ok(MSG_MISSING_SCENE, Vec::new())
}
