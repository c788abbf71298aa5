pub mod protocol;
pub mod session;

use axum::{Router, routing::get};

use crate::bootstrap::engine::Engine;

pub fn routes(engine: Engine) -> Router {
    Router::new()
        .route("/api/sync", get(session::ws_entry))
        .with_state(engine)
}
