// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! HTTP + WebSocket transport for the telemetry pipeline. The two surfaces
//! bind separate listeners (§6): the instrument service HTTP API and the
//! subscriber WebSocket feed scale independently and fail independently.

pub mod http;
pub mod ws;

use std::sync::Arc;

use axum::extract::State;
use axum::http::{Request, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::Router;
use tower_http::cors::CorsLayer;

use crate::state::AppState;

/// Bearer-token middleware for the HTTP surface. The WebSocket surface
/// authenticates inline (query-string token, see `ws::admit`) since the
/// upgrade handshake has no response body to carry a rejection through.
async fn auth_layer(state: State<Arc<AppState>>, req: Request<axum::body::Body>, next: Next) -> Response {
    if req.uri().path() == "/health" {
        return next.run(req).await;
    }

    let token = req
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    if let Err(err) = state.auth.resolve(token) {
        let body = err.to_error_body(err.to_string());
        return (
            StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::UNAUTHORIZED),
            axum::Json(crate::error::ErrorResponse { error: body }),
        )
            .into_response();
    }

    next.run(req).await
}

/// Build the instrument service HTTP router: connect, start a run,
/// emergency-stop, enumerate and tear down connections.
pub fn build_http_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(http::health))
        .route("/connect", post(http::connect))
        .route("/start_run", post(http::start_run))
        .route("/emergency_stop", post(http::emergency_stop))
        .route("/connections", get(http::list_connections))
        .route("/connections/{id}", delete(http::disconnect))
        .layer(middleware::from_fn_with_state(state.clone(), auth_layer))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Build the subscriber WebSocket router.
pub fn build_ws_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws/runs/{run_id}", get(ws::ws_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
