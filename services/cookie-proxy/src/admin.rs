//! Admin API
//!
//! Endpoints:
//! - GET  /admin/request-logs: recent proxied calls, newest first
//! - POST /admin/clear-logs: drop the request log
//! - GET  /admin/config: effective configuration

use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use tracing::info;

use crate::config::Config;
use crate::history::RequestHistory;

/// Shared state for admin API handlers.
#[derive(Clone)]
pub struct AdminState {
    history: Arc<RequestHistory>,
    config: Arc<Config>,
}

impl AdminState {
    pub fn new(history: Arc<RequestHistory>, config: Arc<Config>) -> Self {
        Self { history, config }
    }
}

/// Build the admin router.
pub fn build_admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/admin/request-logs", get(request_logs))
        .route("/admin/clear-logs", post(clear_logs))
        .route("/admin/config", get(effective_config))
        .with_state(state)
}

async fn request_logs(State(state): State<AdminState>) -> impl IntoResponse {
    axum::Json(state.history.snapshot().await)
}

async fn clear_logs(State(state): State<AdminState>) -> impl IntoResponse {
    let cleared = state.history.clear().await;
    info!(cleared, "request log cleared");
    (
        StatusCode::OK,
        axum::Json(serde_json::json!({ "success": true, "cleared": cleared })),
    )
}

/// The configuration holds no secrets; cookies live only in the store.
async fn effective_config(State(state): State<AdminState>) -> impl IntoResponse {
    axum::Json(state.config.as_ref().clone())
}
