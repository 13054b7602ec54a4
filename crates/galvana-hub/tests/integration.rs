// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! End-to-end tests driven against a real bound listener rather than
//! `axum_test`'s in-process transport, since scenario 6 (teardown on client
//! disconnect) needs an actual TCP socket close to observe.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use galvana_hub::auth::StaticTokenOracle;
use galvana_hub::bus::LocalBus;
use galvana_hub::config::HubConfig;
use galvana_hub::driver::registry::DriverRegistry;
use galvana_hub::record_store::InMemoryRecordStore;
use galvana_hub::service::InstrumentService;
use galvana_hub::state::AppState;
use galvana_hub::transport::build_ws_router;

fn test_config() -> HubConfig {
    HubConfig {
        ws_host: "127.0.0.1".to_owned(),
        ws_port: 0,
        http_host: "127.0.0.1".to_owned(),
        http_port: 0,
        auth_token: None,
        max_connections_per_principal: 1,
        queue_capacity: 100,
        medium_threshold: 0.3,
        slow_threshold: 0.7,
        enqueue_timeout_seconds: 1.0,
        warning_cooldown_seconds: 5.0,
        keyframe_interval: 1,
        sampling_rate_hz: 200.0,
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

struct Harness {
    state: Arc<AppState>,
    run_id: String,
    ws_addr: std::net::SocketAddr,
}

/// Connects a mock driver, programs and starts a short CV run owned by
/// `"anonymous"` (the default principal with no auth token configured), and
/// serves the WebSocket router on a real loopback listener.
async fn spawn_harness() -> Harness {
    let config = test_config();
    let shutdown = CancellationToken::new();
    let bus: Arc<dyn galvana_hub::bus::FrameBus> = Arc::new(LocalBus::new());
    let service = Arc::new(InstrumentService::new(
        DriverRegistry::with_builtins(&config),
        Arc::clone(&bus),
        config.clone(),
        shutdown.clone(),
    ));
    let auth: Arc<dyn galvana_hub::auth::AuthOracle> = Arc::new(StaticTokenOracle::new(None));
    let record_store = Arc::new(InMemoryRecordStore::new());
    let state = Arc::new(AppState::new(service, bus, record_store, auth, config, shutdown));

    let connection_id = state.service.connect("mock", None, "anonymous", &Value::Null).await.unwrap();
    let waveform = json!({
        "type": "triangle",
        "initial_value": -0.2,
        "final_value": 0.2,
        "duration": 0.3,
    });
    let waveform: galvana_hub::driver::Waveform = serde_json::from_value(waveform).unwrap();
    let run_id = state
        .service
        .start_run(&connection_id, None, galvana_hub::driver::Technique::Cv, waveform)
        .await
        .unwrap();
    state.record_store.create_run(&run_id, "anonymous").unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let ws_addr = listener.local_addr().unwrap();
    let router = build_ws_router(Arc::clone(&state));
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    Harness { state, run_id, ws_addr }
}

/// Opens a raw TCP connection and performs the WebSocket opening handshake by
/// hand (the production dependency set carries no WS *client*, only the
/// server side via `axum::extract::ws`).
async fn handshake(addr: std::net::SocketAddr, path: &str) -> TcpStream {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = format!(
        "GET {path} HTTP/1.1\r\n\
         Host: {addr}\r\n\
         Connection: Upgrade\r\n\
         Upgrade: websocket\r\n\
         Sec-WebSocket-Version: 13\r\n\
         Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n"
    );
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        stream.read_exact(&mut byte).await.unwrap();
        buf.push(byte[0]);
        if buf.ends_with(b"\r\n\r\n") {
            break;
        }
    }
    let response = String::from_utf8_lossy(&buf);
    assert!(response.starts_with("HTTP/1.1 101"), "handshake rejected: {response}");
    stream
}

/// Reads one unmasked server-to-client WebSocket text frame and returns its
/// payload. Handles the 7-bit and 16-bit extended length forms; our frames
/// never need the 64-bit form.
async fn read_text_frame(stream: &mut TcpStream) -> String {
    let mut header = [0u8; 2];
    stream.read_exact(&mut header).await.unwrap();
    let len = match header[1] & 0x7f {
        126 => {
            let mut ext = [0u8; 2];
            stream.read_exact(&mut ext).await.unwrap();
            u16::from_be_bytes(ext) as usize
        }
        n => n as usize,
    };
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await.unwrap();
    String::from_utf8(payload).unwrap()
}

#[tokio::test]
async fn subscriber_receives_a_connected_event_then_data_frames() {
    let harness = spawn_harness().await;
    let mut stream = handshake(harness.ws_addr, &format!("/ws/runs/{}", harness.run_id)).await;

    let connected: Value = serde_json::from_str(&read_text_frame(&mut stream).await).unwrap();
    assert_eq!(connected["type"], "event");
    assert_eq!(connected["event"], "connected");

    let frame: Value = serde_json::from_str(&read_text_frame(&mut stream).await).unwrap();
    assert_eq!(frame["type"], "frame");
    assert_eq!(frame["run_id"], harness.run_id);
    assert!(frame["voltage"].is_number());
}

#[tokio::test]
async fn a_second_subscriber_beyond_the_per_principal_quota_is_rejected() {
    let harness = spawn_harness().await;
    let path = format!("/ws/runs/{}", harness.run_id);

    // max_connections_per_principal is 1 in `test_config`.
    let _first = handshake(harness.ws_addr, &path).await;

    // Give the first subscriber's accept task a moment to acquire its permit
    // before the second dials in, so the quota check actually contends.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(harness.state.connections.active_connections("anonymous"), 1);

    let mut second = TcpStream::connect(harness.ws_addr).await.unwrap();
    let request = format!(
        "GET {path} HTTP/1.1\r\n\
         Host: {}\r\n\
         Connection: Upgrade\r\n\
         Upgrade: websocket\r\n\
         Sec-WebSocket-Version: 13\r\n\
         Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n",
        harness.ws_addr
    );
    second.write_all(request.as_bytes()).await.unwrap();

    // The handshake itself is accepted at the HTTP layer (admission doesn't
    // reserve quota until the socket is live); the server then closes the
    // socket immediately once it finds no permit available.
    let mut buf = [0u8; 4096];
    let n = second.read(&mut buf).await.unwrap();
    assert!(n > 0);
}

#[tokio::test]
async fn dropping_the_socket_releases_the_quota_permit() {
    let harness = spawn_harness().await;
    let path = format!("/ws/runs/{}", harness.run_id);
    let stream = handshake(harness.ws_addr, &path).await;

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(harness.state.connections.active_connections("anonymous"), 1);

    drop(stream);

    // The egester's `tokio::select!` loop needs one failed send (or closed
    // read) to notice the drop and unwind, releasing the `Permit`.
    let mut released = false;
    for _ in 0..20 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        if harness.state.connections.active_connections("anonymous") == 0 {
            released = true;
            break;
        }
    }
    assert!(released, "quota permit was not released after the socket dropped");
}
