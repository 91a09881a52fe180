//! API routes

pub mod admin;
pub mod orders;
pub mod webhooks;

#[cfg(test)]
mod router_tests;

use axum::{
    middleware,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};

use crate::{
    auth::{require_admin, require_auth},
    state::AppState,
};

/// Build the application router
pub fn create_router(state: AppState) -> Router {
    let authenticated = Router::new()
        .route("/orders", post(orders::create_order))
        .route("/orders/{id}", get(orders::get_order))
        .route(
            "/orders/by-session/{session_id}",
            get(orders::get_order_by_session),
        )
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));

    let admin = Router::new()
        .route("/orders/{id}/sync", post(admin::sync_order))
        .route("/admin/invariants", get(admin::run_invariants))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_admin));

    Router::new()
        .route("/health", get(health))
        .route("/webhook", post(webhooks::stripe_webhook))
        .merge(authenticated)
        .merge(admin)
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}
