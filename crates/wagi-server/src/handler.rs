//! Request handlers.
//!
//! Every request not claimed by a fixed route is dispatched through the
//! current route table to a WAGI module.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{Response, StatusCode};
use axum::response::IntoResponse;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use wagi_common::RuntimeError;

use crate::request::{cgi_request, request_host};
use crate::response::{HostResponse, guest_response};
use crate::routes::RouteMatch;
use crate::state::AppState;

/// Dispatch a request to the module serving its route.
///
/// This handler:
/// 1. Matches method, path and host against a snapshot of the route table
/// 2. Collects the body, up to the configured limit
/// 3. Runs the module on a blocking worker
/// 4. Streams the module's output back as the response
#[instrument(
    skip_all,
    fields(method = %request.method(), path = %request.uri().path(), request_id)
)]
pub async fn handle_request(State(state): State<AppState>, request: Request) -> Response<Body> {
    let start = Instant::now();
    let request_id = Uuid::new_v4().to_string();
    tracing::Span::current().record("request_id", request_id.as_str());

    let (parts, body) = request.into_parts();
    let host = request_host(&parts);

    // Held until the response head is built, even if a rebuild swaps the table.
    let routes = state.routes();
    let entry = match routes.lookup(parts.method.as_str(), parts.uri.path(), host.as_deref()) {
        RouteMatch::Found(entry) => entry,
        RouteMatch::MethodNotAllowed { allowed } => {
            info!(allowed = %allowed, "Method not allowed");
            return HostResponse::text(405, "Method Not Allowed")
                .with_header("allow", allowed)
                .into_axum_response();
        }
        RouteMatch::NotFound => {
            info!("No route matched");
            return HostResponse::text(404, "Not Found").into_axum_response();
        }
    };

    let body = match axum::body::to_bytes(body, state.max_body_bytes()).await {
        Ok(body) => body,
        Err(e) => {
            warn!(error = %e, limit = state.max_body_bytes(), "Failed to read request body");
            return HostResponse::error(413, "Request body too large").into_axum_response();
        }
    };

    let remote = parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());
    let cgi = cgi_request(&parts, body, remote);

    let result = Arc::clone(state.host())
        .handle(
            Arc::clone(entry.module()),
            entry.pattern().to_string(),
            cgi,
            request_id.clone(),
        )
        .await;

    match result {
        Ok(response) => {
            info!(
                status = response.head.status,
                guest_ms = response.duration.as_millis(),
                duration_ms = start.elapsed().as_millis(),
                "Request completed"
            );
            guest_response(response)
        }
        Err(e) => {
            error!(
                error = %e,
                module = %entry.module().path.display(),
                duration_ms = start.elapsed().as_millis(),
                "Request failed"
            );
            error_to_response(&e).into_axum_response()
        }
    }
}

/// Convert an execution error to the response the client sees.
///
/// Guest output is never echoed; details stay in the log.
fn error_to_response(error: &RuntimeError) -> HostResponse {
    match error {
        RuntimeError::ExecutionTimeout { .. } => HostResponse::error(504, "Gateway timeout"),
        _ => HostResponse::error(500, "Internal server error"),
    }
}

/// Health check handler.
///
/// Returns 200 OK if the server is running.
pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}
