// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Subscriber WebSocket handler (§4.6, §6): `GET /ws/runs/{run-id}?token=...`.
//! Admission is five explicit steps — resolve principal, check run ownership,
//! check quota, accept and wire up backpressure, then launch the ingester and
//! egester task pair bound to the socket's lifetime.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, Query, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::backpressure::{BackpressureController, BackpressureThresholds};
use crate::driver::Frame;
use crate::error::HubError;
use crate::state::AppState;

#[derive(Debug, Clone, Deserialize)]
pub struct SubscribeQuery {
    pub token: Option<String>,
}

/// `GET /ws/runs/{run-id}` — subscriber upgrade.
pub async fn ws_handler(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
    Query(query): Query<SubscribeQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    match admit(&state, &run_id, query.token.as_deref()).await {
        Ok(principal) => ws.on_upgrade(move |socket| handle_socket(socket, state, run_id, principal)).into_response(),
        Err(err) => ws_reject(err),
    }
}

fn ws_reject(err: HubError) -> axum::response::Response {
    (axum::http::StatusCode::from_u16(err.http_status()).unwrap_or(axum::http::StatusCode::INTERNAL_SERVER_ERROR), err.to_string())
        .into_response()
}

/// Steps 1-3 of §4.6: resolve principal, check run ownership, check quota.
/// Does not allocate a backpressure controller yet — that only happens after
/// the socket upgrade actually succeeds (step 4).
async fn admit(state: &AppState, run_id: &str, token: Option<&str>) -> Result<String, HubError> {
    let principal = state.auth.resolve(token)?;
    let is_superuser = state.auth.is_superuser(&principal);
    state.record_store.check_access(run_id, &principal, is_superuser)?;
    // Quota is actually acquired once the socket is live (see `handle_socket`)
    // so a rejected upgrade never needs an explicit release path.
    Ok(principal)
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, run_id: String, principal: String) {
    let permit = match state.connections.acquire(&principal) {
        Ok(permit) => permit,
        Err(_) => {
            let (mut sink, _) = socket.split();
            let _ = sink.send(Message::Close(None)).await;
            return;
        }
    };

    let Ok(bus_rx) = state.bus.subscribe(&run_id).await else {
        warn!(run_id = %run_id, "bus subscribe failed during admission");
        return;
    };

    let thresholds = BackpressureThresholds {
        medium: state.config.medium_threshold,
        slow: state.config.slow_threshold,
        enqueue_timeout: state.config.enqueue_timeout(),
        warning_cooldown: state.config.warning_cooldown(),
    };
    let controller = Arc::new(BackpressureController::new(run_id.clone(), state.config.queue_capacity, thresholds));
    state.backpressure.register(&controller);
    let Some(mut subscriber_rx) = controller.take_receiver() else {
        return;
    };

    let (mut ws_tx, mut ws_rx) = socket.split();

    let connected = Frame::event(
        run_id.clone(),
        "connected",
        format!(
            "channel={} capacity={} slow_threshold={}",
            crate::bus::topic_for_run(&run_id),
            state.config.queue_capacity,
            state.config.slow_threshold
        ),
    );
    if send_frame(&mut ws_tx, &connected).await.is_err() {
        return;
    }

    let ingester = spawn_ingester(Arc::clone(&controller), bus_rx, state.shutdown.clone());
    let cancel = state.shutdown.clone();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            frame = subscriber_rx.recv(&controller) => {
                match frame {
                    Some(frame) => {
                        if send_frame(&mut ws_tx, &frame).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }

    ingester.abort();
    // Retiring the bus topic is the telemetry bridge's job (it owns the
    // publisher side and knows when the run itself ends), not a single
    // subscriber's: other subscribers of this run may still be connected.
    debug!(run_id = %run_id, principal = %permit.principal(), "subscriber torn down");
}

async fn send_frame(ws_tx: &mut futures_util::stream::SplitSink<WebSocket, Message>, frame: &Frame) -> Result<(), ()> {
    let Ok(text) = serde_json::to_string(frame) else { return Err(()) };
    ws_tx.send(Message::Text(text.into())).await.map_err(|_| ())
}

/// Forwards every bus delivery into the backpressure controller, passing the
/// producer's `is_keyframe` flag straight through.
fn spawn_ingester(
    controller: Arc<BackpressureController>,
    mut bus_rx: crate::bus::FrameReceiver,
    shutdown: tokio_util::sync::CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                frame = bus_rx.recv() => {
                    match frame {
                        Ok(frame) => {
                            controller.enqueue(frame).await;
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        }
    })
}
