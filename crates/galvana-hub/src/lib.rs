// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Galvana Hub: real-time telemetry pipeline for electrochemistry
//! instruments. Drivers stream frames through a safety interlock onto a
//! pub/sub bus; subscribers fan out behind per-connection backpressure and
//! quota enforcement.

pub mod auth;
pub mod backpressure;
pub mod bus;
pub mod config;
pub mod connection;
pub mod driver;
pub mod error;
pub mod record_store;
pub mod service;
pub mod state;
pub mod transport;

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::auth::StaticTokenOracle;
use crate::bus::FrameBus;
use crate::config::HubConfig;
use crate::driver::registry::DriverRegistry;
use crate::record_store::InMemoryRecordStore;
use crate::service::InstrumentService;
use crate::state::AppState;

/// Run the telemetry pipeline until shutdown: binds the instrument service
/// HTTP listener and the subscriber WebSocket listener concurrently, and
/// returns once either stops (or the shutdown token fires).
pub async fn run(config: HubConfig) -> anyhow::Result<()> {
    let shutdown = CancellationToken::new();

    let bus = build_bus(&config).await?;
    let registry = DriverRegistry::with_builtins(&config);
    let service = Arc::new(InstrumentService::new(registry, Arc::clone(&bus), config.clone(), shutdown.clone()));
    let auth: Arc<dyn crate::auth::AuthOracle> = Arc::new(StaticTokenOracle::new(config.auth_token.clone()));
    let record_store = Arc::new(InMemoryRecordStore::new());

    let http_addr = format!("{}:{}", config.http_host, config.http_port);
    let ws_addr = format!("{}:{}", config.ws_host, config.ws_port);

    let state = Arc::new(AppState::new(service, bus, record_store, auth, config, shutdown.clone()));

    let http_router = transport::build_http_router(Arc::clone(&state));
    let ws_router = transport::build_ws_router(Arc::clone(&state));

    let http_listener = TcpListener::bind(&http_addr).await?;
    let ws_listener = TcpListener::bind(&ws_addr).await?;

    tracing::info!(http = %http_addr, ws = %ws_addr, "galvana-hub listening");

    let http_shutdown = shutdown.clone();
    let ws_shutdown = shutdown.clone();
    tokio::try_join!(
        async move {
            axum::serve(http_listener, http_router)
                .with_graceful_shutdown(http_shutdown.cancelled_owned())
                .await
        },
        async move {
            axum::serve(ws_listener, ws_router).with_graceful_shutdown(ws_shutdown.cancelled_owned()).await
        },
    )?;

    Ok(())
}

#[cfg(feature = "nats-bus")]
async fn build_bus(config: &HubConfig) -> anyhow::Result<Arc<dyn FrameBus>> {
    match config.bus_nats_url.as_deref() {
        Some(url) => {
            let bus = bus::nats::NatsBus::connect(url).await?;
            Ok(Arc::new(bus))
        }
        None => Ok(Arc::new(bus::LocalBus::new())),
    }
}

#[cfg(not(feature = "nats-bus"))]
async fn build_bus(_config: &HubConfig) -> anyhow::Result<Arc<dyn FrameBus>> {
    Ok(Arc::new(bus::LocalBus::new()))
}
