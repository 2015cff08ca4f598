//! Node pool data model.
//!
//! Wire names follow the render service and management API (camelCase, with
//! the management API's `preloaded*`/`freeTimeNodes` count names).

use std::collections::BTreeMap;

use renderpool_reconcile::PoolTargets;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::session::SessionHandle;

/// Keys owned by [`NodeRecord`] itself; never copied in from merged metadata.
const RESERVED_KEYS: &[&str] = &[
    "engineId",
    "sceneId",
    "isDistributed",
    "isDistribute",
    "trueName",
    "player",
];

/// One tracked rendering session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeRecord {
    /// Render-service session identifier. Unique within the registry.
    pub engine_id: String,

    /// Scene this node was created for.
    pub scene_id: String,

    /// Claimed by a caller. Only ever flips false -> true.
    #[serde(default, alias = "isDistribute")]
    pub is_distributed: bool,

    /// Last claimant, set on distribution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub true_name: Option<String>,

    /// Live session handle. Present only in the process that created the session.
    #[serde(skip)]
    pub session: Option<SessionHandle>,

    /// Scene config and session metadata snapshotted at creation time.
    #[serde(flatten)]
    pub metadata: Map<String, Value>,
}

impl NodeRecord {
    /// Build the record for a freshly created session.
    ///
    /// Scene config fields are merged first and session metadata second, so
    /// the render service wins on overlapping keys.
    pub fn created(
        session: SessionHandle,
        scene: &SceneDemandConfig,
        live: Option<&LiveSession>,
    ) -> Self {
        let mut metadata = Map::new();
        if let Ok(Value::Object(fields)) = serde_json::to_value(scene) {
            merge_unreserved(&mut metadata, fields);
        }
        if let Some(Ok(Value::Object(fields))) = live.map(serde_json::to_value) {
            merge_unreserved(&mut metadata, fields);
        }

        Self {
            engine_id: session.engine_id().to_string(),
            scene_id: scene.scene_id.clone(),
            is_distributed: false,
            true_name: None,
            session: Some(session),
            metadata,
        }
    }

    pub fn is_idle(&self) -> bool {
        !self.is_distributed
    }

    /// Externally visible view, without the session handle.
    pub fn projection(&self) -> NodeProjection {
        NodeProjection {
            engine_id: self.engine_id.clone(),
            scene_id: self.scene_id.clone(),
            is_distributed: self.is_distributed,
            true_name: self.true_name.clone(),
            metadata: self.metadata.clone(),
        }
    }
}

fn merge_unreserved(target: &mut Map<String, Value>, fields: Map<String, Value>) {
    for (key, value) in fields {
        if !RESERVED_KEYS.contains(&key.as_str()) {
            target.insert(key, value);
        }
    }
}

/// Node as returned by the HTTP API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeProjection {
    pub engine_id: String,
    pub scene_id: String,
    pub is_distributed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub true_name: Option<String>,
    #[serde(flatten)]
    pub metadata: Map<String, Value>,
}

/// Desired pool policy for one scene, as served by the management API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SceneDemandConfig {
    #[serde(deserialize_with = "id_string")]
    pub scene_id: String,

    #[serde(
        default,
        rename = "preloadedMinNodes",
        alias = "minNodes",
        deserialize_with = "lenient_count"
    )]
    pub min_nodes: u32,

    #[serde(
        default,
        rename = "preloadedMaxNodes",
        alias = "maxNodes",
        deserialize_with = "lenient_count"
    )]
    pub max_nodes: u32,

    #[serde(
        default,
        rename = "freeTimeNodes",
        alias = "idleNodes",
        deserialize_with = "lenient_count"
    )]
    pub idle_nodes: u32,

    #[serde(default)]
    pub is_active: bool,

    /// Remaining scene fields, carried into created node records.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl SceneDemandConfig {
    pub fn targets(&self) -> PoolTargets {
        PoolTargets {
            min_nodes: self.min_nodes,
            max_nodes: self.max_nodes,
            idle_nodes: self.idle_nodes,
        }
    }
}

/// Session metadata reported by the render service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LiveSession {
    /// Attached clients keyed by client id.
    #[serde(default)]
    pub clients: Value,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl LiveSession {
    pub fn client_count(&self) -> usize {
        match &self.clients {
            Value::Object(map) => map.len(),
            Value::Array(items) => items.len(),
            _ => 0,
        }
    }
}

/// Live sessions keyed by engine id.
pub type LiveSessionSet = BTreeMap<String, LiveSession>;

fn lenient_count<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::Number(n)) => n
            .as_u64()
            .map(|v| v.min(u32::MAX as u64) as u32)
            .unwrap_or(0),
        Some(Value::String(s)) => s.trim().parse().unwrap_or(0),
        _ => 0,
    })
}

fn id_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number id, got {other}"
        ))),
    }
}
