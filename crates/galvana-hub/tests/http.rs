// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Integration tests for the instrument service HTTP API.
//!
//! Uses `axum_test::TestServer` — no real TCP needed.

use std::sync::Arc;

use axum_test::TestServer;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use galvana_hub::auth::StaticTokenOracle;
use galvana_hub::bus::LocalBus;
use galvana_hub::config::HubConfig;
use galvana_hub::driver::registry::DriverRegistry;
use galvana_hub::record_store::InMemoryRecordStore;
use galvana_hub::service::InstrumentService;
use galvana_hub::state::AppState;
use galvana_hub::transport::build_http_router;

fn test_config() -> HubConfig {
    HubConfig {
        ws_host: "127.0.0.1".to_owned(),
        ws_port: 0,
        http_host: "127.0.0.1".to_owned(),
        http_port: 0,
        auth_token: None,
        max_connections_per_principal: 3,
        queue_capacity: 100,
        medium_threshold: 0.3,
        slow_threshold: 0.7,
        enqueue_timeout_seconds: 1.0,
        warning_cooldown_seconds: 5.0,
        keyframe_interval: 10,
        sampling_rate_hz: 100.0,
        driver_connect_timeout_seconds: 5.0,
        max_experiment_duration_seconds: 3600.0,
        voltage_min: -10.0,
        voltage_max: 10.0,
        current_min: -1.0,
        current_max: 1.0,
        stop_on_disconnect: true,
        #[cfg(feature = "nats-bus")]
        bus_nats_url: None,
    }
}

fn test_state() -> Arc<AppState> {
    let config = test_config();
    let shutdown = CancellationToken::new();
    let bus: Arc<dyn galvana_hub::bus::FrameBus> = Arc::new(LocalBus::new());
    let service = Arc::new(InstrumentService::new(DriverRegistry::with_builtins(&config), Arc::clone(&bus), config.clone(), shutdown.clone()));
    let auth: Arc<dyn galvana_hub::auth::AuthOracle> = Arc::new(StaticTokenOracle::new(None));
    let record_store = Arc::new(InMemoryRecordStore::new());
    Arc::new(AppState::new(service, bus, record_store, auth, config, shutdown))
}

fn test_server(state: Arc<AppState>) -> TestServer {
    let router = build_http_router(state);
    TestServer::new(router).expect("failed to create test server")
}

#[tokio::test]
async fn health_reports_zero_connections_on_a_fresh_service() -> anyhow::Result<()> {
    let server = test_server(test_state());
    let resp = server.get("/health").await;
    resp.assert_status_ok();

    let body: serde_json::Value = resp.json();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["active_connections"], 0);
    assert_eq!(body["active_streams"], 0);
    Ok(())
}

#[tokio::test]
async fn connect_creates_a_session_and_reports_mock_capabilities() -> anyhow::Result<()> {
    let server = test_server(test_state());
    let resp = server.post("/connect").json(&json!({ "driver": "mock" })).await;
    resp.assert_status(axum::http::StatusCode::CREATED);

    let body: serde_json::Value = resp.json();
    assert!(body["connection_id"].as_str().is_some());
    let caps: Vec<&str> = body["capabilities"].as_array().unwrap().iter().map(|v| v.as_str().unwrap()).collect();
    assert!(caps.contains(&"CV"));
    assert!(caps.contains(&"CA"));
    assert!(caps.contains(&"CP"));
    assert!(caps.contains(&"LSV"));
    assert!(!caps.contains(&"EIS"));
    Ok(())
}

#[tokio::test]
async fn connect_with_unknown_driver_returns_404() -> anyhow::Result<()> {
    let server = test_server(test_state());
    let resp = server.post("/connect").json(&json!({ "driver": "nonexistent" })).await;
    resp.assert_status(axum::http::StatusCode::NOT_FOUND);
    Ok(())
}

#[tokio::test]
async fn start_run_with_out_of_bounds_waveform_reports_a_safety_violation() -> anyhow::Result<()> {
    let server = test_server(test_state());
    let connect_resp = server.post("/connect").json(&json!({ "driver": "mock" })).await;
    let connection_id = connect_resp.json::<serde_json::Value>()["connection_id"].as_str().unwrap().to_owned();

    let resp = server
        .post("/start_run")
        .json(&json!({
            "connection_id": connection_id,
            "technique": "cyclic_voltammetry",
            "waveform": {
                "type": "step",
                "initial_value": 50.0,
                "duration": 1.0,
            },
        }))
        .await;
    resp.assert_status(axum::http::StatusCode::BAD_REQUEST);
    let body: serde_json::Value = resp.json();
    assert_eq!(body["error"]["code"], "SAFETY_VIOLATION");
    Ok(())
}

#[tokio::test]
async fn start_run_against_unknown_connection_returns_404() -> anyhow::Result<()> {
    let server = test_server(test_state());
    let resp = server
        .post("/start_run")
        .json(&json!({
            "connection_id": "does-not-exist",
            "technique": "cyclic_voltammetry",
            "waveform": { "type": "step", "initial_value": 0.0, "duration": 1.0 },
        }))
        .await;
    resp.assert_status(axum::http::StatusCode::NOT_FOUND);
    Ok(())
}

#[tokio::test]
async fn emergency_stop_latches_and_blocks_a_subsequent_start() -> anyhow::Result<()> {
    let server = test_server(test_state());
    let connect_resp = server.post("/connect").json(&json!({ "driver": "mock" })).await;
    let connection_id = connect_resp.json::<serde_json::Value>()["connection_id"].as_str().unwrap().to_owned();

    let stop_resp = server.post("/emergency_stop").json(&json!({ "connection_id": connection_id })).await;
    stop_resp.assert_status_ok();
    let stopped: serde_json::Value = stop_resp.json();
    assert_eq!(stopped["stopped"][0], connection_id);

    let start_resp = server
        .post("/start_run")
        .json(&json!({
            "connection_id": connection_id,
            "technique": "cyclic_voltammetry",
            "waveform": { "type": "step", "initial_value": 0.0, "duration": 1.0 },
        }))
        .await;
    start_resp.assert_status(axum::http::StatusCode::CONFLICT);
    let body: serde_json::Value = start_resp.json();
    assert_eq!(body["error"]["code"], "EMERGENCY_STOP_ACTIVE");
    Ok(())
}

#[tokio::test]
async fn emergency_stop_without_a_target_is_invalid_input() -> anyhow::Result<()> {
    let server = test_server(test_state());
    let resp = server.post("/emergency_stop").json(&json!({})).await;
    resp.assert_status(axum::http::StatusCode::BAD_REQUEST);
    Ok(())
}

#[tokio::test]
async fn list_connections_reflects_connect_and_disconnect() -> anyhow::Result<()> {
    let server = test_server(test_state());
    let connect_resp = server.post("/connect").json(&json!({ "driver": "mock" })).await;
    let connection_id = connect_resp.json::<serde_json::Value>()["connection_id"].as_str().unwrap().to_owned();

    let list_resp = server.get("/connections").await;
    let list: Vec<serde_json::Value> = list_resp.json();
    assert_eq!(list.len(), 1);
    assert_eq!(list[0]["connection_id"], connection_id);

    let del_resp = server.delete(&format!("/connections/{connection_id}")).await;
    del_resp.assert_status_ok();

    let list_resp = server.get("/connections").await;
    let list: Vec<serde_json::Value> = list_resp.json();
    assert!(list.is_empty());
    Ok(())
}

#[tokio::test]
async fn auth_layer_rejects_missing_bearer_token_when_a_token_is_configured() -> anyhow::Result<()> {
    let state = {
        let config = test_config();
        let shutdown = CancellationToken::new();
        let bus: Arc<dyn galvana_hub::bus::FrameBus> = Arc::new(LocalBus::new());
        let service = Arc::new(InstrumentService::new(
            DriverRegistry::with_builtins(&config),
            Arc::clone(&bus),
            config.clone(),
            shutdown.clone(),
        ));
        let auth: Arc<dyn galvana_hub::auth::AuthOracle> = Arc::new(StaticTokenOracle::new(Some("secret".to_owned())));
        let record_store = Arc::new(InMemoryRecordStore::new());
        Arc::new(AppState::new(service, bus, record_store, auth, config, shutdown))
    };

    let server = test_server(state);
    let resp = server.post("/connect").json(&json!({ "driver": "mock" })).await;
    resp.assert_status(axum::http::StatusCode::UNAUTHORIZED);
    Ok(())
}
