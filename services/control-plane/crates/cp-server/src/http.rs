//! Read-only HTTP surface: health probe and the live agent list.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::manager::AgentManager;

pub fn router(manager: Arc<AgentManager>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/agents", get(list_agents))
        .layer(TraceLayer::new_for_http())
        .with_state(manager)
}

/// Docker / load-balancer probe.
async fn health() -> StatusCode {
    StatusCode::OK
}

async fn list_agents(State(manager): State<Arc<AgentManager>>) -> Response {
    match manager.get_active_agents().await {
        Ok(agents) => Json(agents).into_response(),
        Err(e) => {
            warn!(error = %e, "listing agents failed");
            (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response()
        }
    }
}
