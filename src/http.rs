//! HTTP front for a node's replicated map.
//!
//! Values are arbitrary JSON documents stored as JSON text, so any client can read what
//! another one wrote.

use axum::{
    Json, Router,
    extract::{Extension, Path},
    http::StatusCode,
    routing::{delete, get, post},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::channel::group::GroupChannel;
use crate::map::replicated::ReplicatedMap;
use crate::map::types::EntryRole;

pub type DocumentMap = ReplicatedMap<String, String>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PutRequest {
    pub key: String,
    pub value: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PutResponse {
    pub success: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetResponse {
    pub found: bool,
    pub value: Option<serde_json::Value>,
    pub role: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberInfo {
    pub id: String,
    pub address: String,
    pub seq: u64,
    pub alive_since_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MembersResponse {
    pub local: MemberInfo,
    pub members: Vec<MemberInfo>,
    pub map_members: usize,
}

pub fn router(map: DocumentMap, channel: Arc<GroupChannel>) -> Router {
    Router::new()
        .route("/put", post(handle_put))
        .route("/get/:key", get(handle_get))
        .route("/remove/:key", delete(handle_remove))
        .route("/members", get(handle_members))
        .layer(Extension(map))
        .layer(Extension(channel))
}

pub async fn handle_put(
    Extension(map): Extension<DocumentMap>,
    Json(req): Json<PutRequest>,
) -> (StatusCode, Json<PutResponse>) {
    let value = match serde_json::to_string(&req.value) {
        Ok(v) => v,
        Err(e) => {
            tracing::error!("Failed to serialize value: {}", e);
            return (
                StatusCode::BAD_REQUEST,
                Json(PutResponse { success: false }),
            );
        }
    };

    match map.put(&req.key, &value).await {
        Ok(()) => (StatusCode::OK, Json(PutResponse { success: true })),
        Err(e) => {
            tracing::error!("Failed to put {}: {}", req.key, e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(PutResponse { success: false }),
            )
        }
    }
}

pub async fn handle_get(
    Extension(map): Extension<DocumentMap>,
    Path(key): Path<String>,
) -> (StatusCode, Json<GetResponse>) {
    let role = map.entry_role(&key).map(|r| role_name(r).to_string());

    match map.get(&key).await {
        Ok(Some(text)) => match serde_json::from_str(&text) {
            Ok(value) => (
                StatusCode::OK,
                Json(GetResponse {
                    found: true,
                    value: Some(value),
                    role,
                }),
            ),
            Err(e) => {
                tracing::error!("Stored value for {} is not JSON: {}", key, e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(GetResponse {
                        found: true,
                        value: None,
                        role,
                    }),
                )
            }
        },
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(GetResponse {
                found: false,
                value: None,
                role,
            }),
        ),
        Err(e) => {
            tracing::error!("Failed to get {}: {}", key, e);
            let status = if e.is_timeout() {
                StatusCode::GATEWAY_TIMEOUT
            } else {
                StatusCode::INTERNAL_SERVER_ERROR
            };
            (
                status,
                Json(GetResponse {
                    found: false,
                    value: None,
                    role,
                }),
            )
        }
    }
}

pub async fn handle_remove(
    Extension(map): Extension<DocumentMap>,
    Path(key): Path<String>,
) -> (StatusCode, Json<PutResponse>) {
    match map.remove(&key).await {
        Ok(()) => (StatusCode::OK, Json(PutResponse { success: true })),
        Err(e) => {
            tracing::error!("Failed to remove {}: {}", key, e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(PutResponse { success: false }),
            )
        }
    }
}

pub async fn handle_members(
    Extension(channel): Extension<Arc<GroupChannel>>,
    Extension(map): Extension<DocumentMap>,
) -> Json<MembersResponse> {
    let info = |m: &crate::membership::types::Member| MemberInfo {
        id: m.unique_id.to_string(),
        address: m.name(),
        seq: m.seq,
        alive_since_ms: m.alive_since_ms,
    };

    Json(MembersResponse {
        local: info(&channel.local_member()),
        members: channel.members().iter().map(info).collect(),
        map_members: map.map_members().len(),
    })
}

fn role_name(role: EntryRole) -> &'static str {
    match role {
        EntryRole::Primary => "primary",
        EntryRole::Backup => "backup",
        EntryRole::Proxy => "proxy",
    }
}
