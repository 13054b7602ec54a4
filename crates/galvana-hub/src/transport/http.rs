// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! HTTP handlers for the instrument service surface (§6): connect, start a
//! run, emergency-stop, enumerate and tear down connections.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::driver::{DriverInfo, Technique, Waveform};
use crate::error::HubError;
use crate::service::EmergencyStopTarget;
use crate::state::AppState;

fn principal_from_headers(state: &AppState, headers: &HeaderMap) -> Result<String, HubError> {
    let token = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    state.auth.resolve(token)
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub active_connections: usize,
    pub active_streams: usize,
    pub bus_connected: bool,
}

pub async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let connections = state.service.list_connections().await;
    let active_streams = connections.iter().filter(|c| c.current_run.is_some()).count();
    Json(HealthResponse {
        status: "ok".to_owned(),
        active_connections: connections.len(),
        active_streams,
        bus_connected: true,
    })
}

#[derive(Debug, Deserialize)]
pub struct ConnectRequest {
    pub driver: String,
    #[serde(default)]
    pub connection_id: Option<String>,
    #[serde(default)]
    pub config: serde_json::Value,
}

#[derive(Debug, Serialize)]
pub struct ConnectResponse {
    pub connection_id: String,
    pub info: DriverInfo,
    pub capabilities: Vec<String>,
}

pub async fn connect(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<ConnectRequest>,
) -> Result<(axum::http::StatusCode, Json<ConnectResponse>), HubError> {
    let principal = principal_from_headers(&state, &headers)?;
    let connection_id = state.service.connect(&req.driver, req.connection_id, &principal, &req.config).await?;

    let connections = state.service.list_connections().await;
    let summary = connections
        .into_iter()
        .find(|c| c.connection_id == connection_id)
        .ok_or(HubError::Internal)?;

    let descriptor = state.service.describe_driver(&summary.driver_name);
    let capabilities = descriptor.as_ref().map(|d| d.capabilities.clone()).unwrap_or_default();
    let info = DriverInfo { name: summary.driver_name.clone(), capabilities: capabilities.clone(), status: crate::driver::DriverStatus::Idle };

    Ok((axum::http::StatusCode::CREATED, Json(ConnectResponse { connection_id, info, capabilities })))
}

#[derive(Debug, Deserialize)]
pub struct StartRunRequest {
    pub connection_id: String,
    #[serde(default)]
    pub run_id: Option<String>,
    pub technique: Technique,
    pub waveform: Waveform,
}

#[derive(Debug, Serialize)]
pub struct StartRunResponse {
    pub run_id: String,
    pub telemetry_channel: String,
}

pub async fn start_run(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<StartRunRequest>,
) -> Result<Json<StartRunResponse>, HubError> {
    let principal = principal_from_headers(&state, &headers)?;
    let run_id = state.service.start_run(&req.connection_id, req.run_id, req.technique, req.waveform).await?;
    state.record_store.create_run(&run_id, &principal)?;
    let telemetry_channel = crate::bus::topic_for_run(&run_id);
    Ok(Json(StartRunResponse { run_id, telemetry_channel }))
}

#[derive(Debug, Serialize)]
pub struct EmergencyStopResponse {
    pub stopped: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct EmergencyStopBody {
    #[serde(default)]
    pub connection_id: Option<String>,
    #[serde(default)]
    pub all: bool,
}

pub async fn emergency_stop(
    State(state): State<Arc<AppState>>,
    Json(body): Json<EmergencyStopBody>,
) -> Result<Json<EmergencyStopResponse>, HubError> {
    let target = if body.all {
        EmergencyStopTarget::All
    } else {
        EmergencyStopTarget::One(body.connection_id.ok_or(HubError::InvalidInput)?)
    };
    let stopped = state.service.emergency_stop(target).await?;
    Ok(Json(EmergencyStopResponse { stopped }))
}

#[derive(Debug, Serialize)]
pub struct ConnectionListEntry {
    pub connection_id: String,
    pub driver_name: String,
    pub principal: String,
    pub current_run: Option<String>,
}

pub async fn list_connections(State(state): State<Arc<AppState>>) -> Json<Vec<ConnectionListEntry>> {
    let connections = state.service.list_connections().await;
    Json(
        connections
            .into_iter()
            .map(|c| ConnectionListEntry {
                connection_id: c.connection_id,
                driver_name: c.driver_name,
                principal: c.principal,
                current_run: c.current_run,
            })
            .collect(),
    )
}

pub async fn disconnect(
    State(state): State<Arc<AppState>>,
    Path(connection_id): Path<String>,
) -> Result<axum::http::StatusCode, HubError> {
    state.service.disconnect(&connection_id).await?;
    Ok(axum::http::StatusCode::OK)
}
