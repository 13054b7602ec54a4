// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::time::Duration;

/// Configuration for the galvana-hub telemetry pipeline.
#[derive(Debug, Clone, clap::Args)]
pub struct HubConfig {
    /// Host the subscriber WebSocket surface binds on.
    #[arg(long, default_value = "127.0.0.1", env = "GALVANA_WS_HOST")]
    pub ws_host: String,

    /// Port the subscriber WebSocket surface listens on.
    #[arg(long, default_value_t = 8080, env = "GALVANA_WS_PORT")]
    pub ws_port: u16,

    /// Host the instrument service HTTP surface binds on.
    #[arg(long, default_value = "127.0.0.1", env = "GALVANA_HTTP_HOST")]
    pub http_host: String,

    /// Port the instrument service HTTP surface listens on.
    #[arg(long, default_value_t = 8081, env = "GALVANA_HTTP_PORT")]
    pub http_port: u16,

    /// Bearer token accepted by the static auth oracle. If unset, any token resolves
    /// to principal `"anonymous"` (development mode only).
    #[arg(long, env = "GALVANA_AUTH_TOKEN")]
    pub auth_token: Option<String>,

    /// Maximum concurrent subscribers per principal.
    #[arg(long, default_value_t = 3, env = "GALVANA_MAX_CONNECTIONS_PER_PRINCIPAL")]
    pub max_connections_per_principal: usize,

    /// Backpressure queue capacity per subscriber.
    #[arg(long, default_value_t = 100, env = "GALVANA_QUEUE_CAPACITY")]
    pub queue_capacity: usize,

    /// Utilization above which the MEDIUM regime begins.
    #[arg(long, default_value_t = 0.3, env = "GALVANA_MEDIUM_THRESHOLD")]
    pub medium_threshold: f64,

    /// Utilization above which the SLOW regime begins.
    #[arg(long, default_value_t = 0.7, env = "GALVANA_SLOW_THRESHOLD")]
    pub slow_threshold: f64,

    /// Bounded enqueue timeout used in the STALLED regime, in seconds.
    #[arg(long, default_value_t = 1.0, env = "GALVANA_ENQUEUE_TIMEOUT_SECONDS")]
    pub enqueue_timeout_seconds: f64,

    /// Minimum interval between repeated MEDIUM-regime warnings, in seconds.
    #[arg(long, default_value_t = 5.0, env = "GALVANA_WARNING_COOLDOWN_SECONDS")]
    pub warning_cooldown_seconds: f64,

    /// Keyframe cadence: every Nth frame is marked non-droppable.
    #[arg(long, default_value_t = 10, env = "GALVANA_KEYFRAME_INTERVAL")]
    pub keyframe_interval: u64,

    /// Mock driver sampling rate in Hz.
    #[arg(long, default_value_t = 100.0, env = "GALVANA_SAMPLING_RATE_HZ")]
    pub sampling_rate_hz: f64,

    /// Driver connect timeout, in seconds.
    #[arg(long, default_value_t = 5.0, env = "GALVANA_DRIVER_CONNECT_TIMEOUT_SECONDS")]
    pub driver_connect_timeout_seconds: f64,

    /// Maximum run duration before the safety interlock forces emergency stop, in seconds.
    #[arg(long, default_value_t = 3600.0, env = "GALVANA_MAX_EXPERIMENT_DURATION_SECONDS")]
    pub max_experiment_duration_seconds: f64,

    /// Minimum allowed voltage, volts.
    #[arg(long, default_value_t = -10.0, env = "GALVANA_VOLTAGE_MIN")]
    pub voltage_min: f64,

    /// Maximum allowed voltage, volts.
    #[arg(long, default_value_t = 10.0, env = "GALVANA_VOLTAGE_MAX")]
    pub voltage_max: f64,

    /// Minimum allowed current, amps.
    #[arg(long, default_value_t = -1.0, env = "GALVANA_CURRENT_MIN")]
    pub current_min: f64,

    /// Maximum allowed current, amps.
    #[arg(long, default_value_t = 1.0, env = "GALVANA_CURRENT_MAX")]
    pub current_max: f64,

    /// Whether a client disconnect drives the driver to a safe stop.
    #[arg(long, default_value_t = true, env = "GALVANA_STOP_ON_DISCONNECT")]
    pub stop_on_disconnect: bool,

    /// NATS URL backing the frame bus. If unset, the in-process bus is used.
    #[cfg(feature = "nats-bus")]
    #[arg(long, env = "GALVANA_BUS_NATS_URL")]
    pub bus_nats_url: Option<String>,
}

impl HubConfig {
    pub fn enqueue_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.enqueue_timeout_seconds.max(0.0))
    }

    pub fn warning_cooldown(&self) -> Duration {
        Duration::from_secs_f64(self.warning_cooldown_seconds.max(0.0))
    }

    pub fn driver_connect_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.driver_connect_timeout_seconds.max(0.0))
    }

    pub fn max_experiment_duration(&self) -> Duration {
        Duration::from_secs_f64(self.max_experiment_duration_seconds.max(0.0))
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.sampling_rate_hz.max(1e-6))
    }

    pub fn voltage_bounds(&self) -> (f64, f64) {
        (self.voltage_min, self.voltage_max)
    }

    pub fn current_bounds(&self) -> (f64, f64) {
        (self.current_min, self.current_max)
    }
}
