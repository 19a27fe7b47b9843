use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use utoipa::ToSchema;

use crate::AppState;

#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    /// `ok`, or `degraded` while the broadcast subscription is down.
    pub status: String,
    /// Users known to this process's registry. Zero usually means the
    /// registry file failed to load.
    pub registry_users: usize,
    /// Registered connections on this process.
    pub connections: usize,
    /// Whether this process is receiving from the broadcast channel.
    pub subscribed: bool,
}

pub fn router() -> Router<AppState> {
    Router::new().route("/health", get(health))
}

#[utoipa::path(
    get,
    path = "/health",
    tag = "Health",
    responses(
        (status = 200, description = "Relay is up", body = HealthResponse),
    ),
)]
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let subscribed = state.broadcaster.is_subscribed();
    Json(HealthResponse {
        status: if subscribed { "ok" } else { "degraded" }.to_string(),
        registry_users: state.registry.len(),
        connections: state.router.len(),
        subscribed,
    })
}
