//! HTTP router configuration.
//!
//! This module provides functions to build the Axum router with all
//! necessary routes and middleware.

use std::time::Duration;

use axum::Router;
use axum::routing::get;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::handler::{handle_request, health_check};
use crate::state::AppState;

/// Path of the liveness probe; it shadows any module route of the same path.
pub const HEALTH_PATH: &str = "/healthz";

/// Build the application router.
///
/// Routes:
/// - `GET /healthz` - Liveness check
/// - anything else - Dispatched through the route table to a module
pub fn build_router(state: AppState, request_timeout: Duration) -> Router {
    Router::new()
        .route(HEALTH_PATH, get(health_check))
        .fallback(handle_request)
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(request_timeout))
        .with_state(state)
}
