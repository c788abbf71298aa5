use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use uuid::Uuid;

use crate::application::access::{Capability, Peer};
use crate::bootstrap::engine::Engine;
use crate::domain::BucketId;
use crate::presentation::auth;

pub fn routes(engine: Engine) -> Router {
    Router::new()
        .route("/buckets/:id/files", get(list_files))
        .route("/buckets/:id/clone", post(clone_bucket))
        .route("/buckets/:id/tombstone", post(tombstone_bucket))
        .with_state(engine)
}

#[derive(Debug, Serialize)]
pub struct FileListResponse {
    pub paths: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CloneResponse {
    pub bucket_id: BucketId,
}

fn bearer_peer(engine: &Engine, headers: &HeaderMap) -> Result<Peer, StatusCode> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .and_then(|t| auth::resolve_peer(&engine.config().auth_secret, t))
        .ok_or(StatusCode::UNAUTHORIZED)
}

/// Snapshot path listing: container agents for their own bucket, services
/// anywhere, browsers wherever the external collaborator grants at least
/// read.
pub async fn list_files(
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    State(engine): State<Engine>,
) -> Result<Json<FileListResponse>, StatusCode> {
    let bucket = BucketId::from(id);
    let peer = bearer_peer(&engine, &headers)?;
    let cap = peer
        .capability(engine.access(), &bucket)
        .await
        .map_err(|_| StatusCode::UNAUTHORIZED)?;
    if cap == Capability::None {
        return Err(StatusCode::UNAUTHORIZED);
    }
    let paths = engine
        .list_bucket_paths(&bucket)
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    Ok(Json(FileListResponse { paths }))
}

pub async fn clone_bucket(
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    State(engine): State<Engine>,
) -> Result<Json<CloneResponse>, StatusCode> {
    let peer = bearer_peer(&engine, &headers)?;
    if peer != Peer::Service {
        return Err(StatusCode::UNAUTHORIZED);
    }
    let bucket_id = engine
        .clone_bucket(&BucketId::from(id))
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    Ok(Json(CloneResponse { bucket_id }))
}

pub async fn tombstone_bucket(
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    State(engine): State<Engine>,
) -> Result<StatusCode, StatusCode> {
    let peer = bearer_peer(&engine, &headers)?;
    if peer != Peer::Service {
        return Err(StatusCode::UNAUTHORIZED);
    }
    engine
        .tombstone_bucket(&BucketId::from(id))
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    Ok(StatusCode::NO_CONTENT)
}
