use axum::{Json, Router, routing::get};
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct HealthResp {
    pub status: &'static str,
}

pub fn routes() -> Router {
    Router::new().route("/health", get(health))
}

pub async fn health() -> Json<HealthResp> {
    Json(HealthResp { status: "ok" })
}
