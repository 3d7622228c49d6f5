//! Health check endpoint.

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;

use crate::state::RelayState;
use crate::store::UserStore;

pub fn router<S: UserStore>() -> Router<RelayState<S>> {
    Router::new().route("/health", get(health_check::<S>))
}

async fn health_check<S: UserStore>(State(state): State<RelayState<S>>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": "herald-relay",
        "version": env!("CARGO_PKG_VERSION"),
        "connections": state.registry.len(),
    }))
}
