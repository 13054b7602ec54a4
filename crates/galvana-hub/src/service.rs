// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Instrument Service: owns the two top-level mutable tables (active
//! connection sessions, active run sessions) and the state machine each run
//! moves through. Table locks are held only for the mutation itself, never
//! across a driver call — mirroring how the upstream health checker clones
//! session handles out from under a lock before doing any I/O.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::StreamExt;
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};
use uuid::Uuid;

use crate::bus::FrameBus;
use crate::config::HubConfig;
use crate::driver::safety::{SafetyInterlock, SafetyLimits};
use crate::driver::registry::DriverRegistry;
use crate::driver::{Frame, Technique, Waveform};
use crate::error::HubError;

/// Absorbing-except-paused run lifecycle, per spec §4.7.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Programmed,
    Running,
    Paused,
    Completed,
    Failed,
    Aborted,
    EmergencyStopped,
}

impl RunState {
    fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Aborted | Self::EmergencyStopped)
    }
}

struct ConnectionEntry {
    id: String,
    driver_name: String,
    principal: String,
    interlock: Mutex<SafetyInterlock>,
    current_run: Mutex<Option<String>>,
}

struct RunEntry {
    id: String,
    connection_id: String,
    state: std::sync::Mutex<RunState>,
    cancel: CancellationToken,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ConnectionSummary {
    pub connection_id: String,
    pub driver_name: String,
    pub principal: String,
    pub current_run: Option<String>,
}

/// Owns driver sessions and run sessions; the sole mutator of both tables.
pub struct InstrumentService {
    registry: DriverRegistry,
    connections: RwLock<HashMap<String, Arc<ConnectionEntry>>>,
    runs: RwLock<HashMap<String, Arc<RunEntry>>>,
    bus: Arc<dyn FrameBus>,
    config: HubConfig,
    shutdown: CancellationToken,
}

impl InstrumentService {
    pub fn new(registry: DriverRegistry, bus: Arc<dyn FrameBus>, config: HubConfig, shutdown: CancellationToken) -> Self {
        Self {
            registry,
            connections: RwLock::new(HashMap::new()),
            runs: RwLock::new(HashMap::new()),
            bus,
            config,
            shutdown,
        }
    }

    fn safety_limits(&self) -> SafetyLimits {
        let (voltage_min, voltage_max) = self.config.voltage_bounds();
        let (current_min, current_max) = self.config.current_bounds();
        SafetyLimits {
            voltage_min,
            voltage_max,
            current_min,
            current_max,
            max_duration_seconds: self.config.max_experiment_duration_seconds,
            stop_on_disconnect: self.config.stop_on_disconnect,
        }
    }

    /// Creates a driver session. Fails with `Conflict` if `connection_id`
    /// already exists, `UnknownDriver` if the registry has no such name,
    /// `ConnectionFailed` if the driver itself refuses.
    pub async fn connect(
        &self,
        driver_name: &str,
        connection_id: Option<String>,
        principal: &str,
        driver_config: &Value,
    ) -> Result<String, HubError> {
        let connection_id = connection_id.unwrap_or_else(|| Uuid::new_v4().to_string());

        {
            let connections = self.connections.read().await;
            if connections.contains_key(&connection_id) {
                return Err(HubError::Conflict);
            }
        }

        let driver = self.registry.create(driver_name, driver_config)?;
        let mut interlock = SafetyInterlock::new(driver, self.safety_limits());
        tokio::time::timeout(self.config.driver_connect_timeout(), interlock.connect())
            .await
            .map_err(|_| HubError::Timeout)?
            .map_err(|_| HubError::ConnectionFailed)?;

        let entry = Arc::new(ConnectionEntry {
            id: connection_id.clone(),
            driver_name: driver_name.to_owned(),
            principal: principal.to_owned(),
            interlock: Mutex::new(interlock),
            current_run: Mutex::new(None),
        });

        let mut connections = self.connections.write().await;
        if connections.contains_key(&connection_id) {
            return Err(HubError::Conflict);
        }
        connections.insert(connection_id.clone(), entry);
        Ok(connection_id)
    }

    /// Programs and starts a run, spawning the telemetry bridge that feeds
    /// the frame bus. Fails with `NotFound` if `connection_id` is unknown,
    /// `SafetyViolation`/`StartFailed` as surfaced by the interlock.
    pub async fn start_run(
        &self,
        connection_id: &str,
        run_id: Option<String>,
        technique: Technique,
        waveform: Waveform,
    ) -> Result<String, HubError> {
        let entry = self.connection(connection_id).await?;
        let run_id = run_id.unwrap_or_else(|| Uuid::new_v4().to_string());

        let mut interlock = entry.interlock.try_lock().map_err(|_| HubError::Conflict)?;
        interlock.program(technique, waveform).await?;
        interlock.start(&run_id).await?;
        let stream = interlock.stream(run_id.clone())?;
        drop(interlock);

        *entry.current_run.lock().await = Some(run_id.clone());

        let run_entry = Arc::new(RunEntry {
            id: run_id.clone(),
            connection_id: connection_id.to_owned(),
            state: std::sync::Mutex::new(RunState::Running),
            cancel: self.shutdown.child_token(),
        });
        self.runs.write().await.insert(run_id.clone(), Arc::clone(&run_entry));

        Self::spawn_telemetry_bridge(Arc::clone(&self.bus), run_entry, stream);

        Ok(run_id)
    }

    fn spawn_telemetry_bridge(bus: Arc<dyn FrameBus>, run_entry: Arc<RunEntry>, mut stream: crate::driver::FrameStream) {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = run_entry.cancel.cancelled() => {
                        set_state(&run_entry, RunState::Aborted);
                        break;
                    }
                    next = stream.next() => {
                        match next {
                            Some(Ok(frame)) => {
                                let terminal = frame.status.as_deref() == Some("emergency-stopped");
                                if let Err(e) = bus.publish(&run_entry.id, frame).await {
                                    warn!(run_id = %run_entry.id, err = %e, "bus publish failed mid-bridge");
                                }
                                if terminal {
                                    set_state(&run_entry, RunState::EmergencyStopped);
                                    break;
                                }
                            }
                            Some(Err(HubError::SafetyViolation)) => {
                                let status = Frame::status(run_entry.id.clone(), "failed", "safety violation mid-run");
                                let _ = bus.publish(&run_entry.id, status).await;
                                set_state(&run_entry, RunState::Failed);
                                break;
                            }
                            Some(Err(e)) => {
                                error!(run_id = %run_entry.id, err = %e, "telemetry bridge error");
                                let status = Frame::status(run_entry.id.clone(), "failed", e.to_string());
                                let _ = bus.publish(&run_entry.id, status).await;
                                set_state(&run_entry, RunState::Failed);
                                break;
                            }
                            None => {
                                let status = Frame::status(run_entry.id.clone(), "completed", "run finished");
                                let _ = bus.publish(&run_entry.id, status).await;
                                set_state(&run_entry, RunState::Completed);
                                break;
                            }
                        }
                    }
                }
            }
            bus.retire(&run_entry.id);
        });
    }

    /// Stops one connection or every active connection. Per spec §4.7, MUST
    /// complete within 100 ms per target — the interlock's own
    /// `emergency_stop` is the fast path that makes this true regardless of
    /// whether a telemetry bridge currently holds the driver.
    pub async fn emergency_stop(&self, target: EmergencyStopTarget) -> Result<Vec<String>, HubError> {
        let targets: Vec<Arc<ConnectionEntry>> = match target {
            EmergencyStopTarget::One(connection_id) => vec![self.connection(&connection_id).await?],
            EmergencyStopTarget::All => self.connections.read().await.values().cloned().collect(),
        };

        let mut stopped = Vec::with_capacity(targets.len());
        for entry in targets {
            let mut interlock = entry.interlock.lock().await;
            interlock.emergency_stop().await?;
            stopped.push(entry.id.clone());

            if let Some(run_id) = entry.current_run.lock().await.clone() {
                if let Some(run_entry) = self.runs.read().await.get(&run_id).cloned() {
                    set_state(&run_entry, RunState::EmergencyStopped);
                }
            }
        }
        Ok(stopped)
    }

    pub async fn list_connections(&self) -> Vec<ConnectionSummary> {
        let connections = self.connections.read().await;
        let mut summaries = Vec::with_capacity(connections.len());
        for entry in connections.values() {
            summaries.push(ConnectionSummary {
                connection_id: entry.id.clone(),
                driver_name: entry.driver_name.clone(),
                principal: entry.principal.clone(),
                current_run: entry.current_run.lock().await.clone(),
            });
        }
        summaries
    }

    pub async fn disconnect(&self, connection_id: &str) -> Result<(), HubError> {
        let entry = {
            let mut connections = self.connections.write().await;
            connections.remove(connection_id).ok_or(HubError::NotFound)?
        };
        let mut interlock = entry.interlock.lock().await;
        interlock.disconnect().await
    }

    async fn connection(&self, connection_id: &str) -> Result<Arc<ConnectionEntry>, HubError> {
        self.connections.read().await.get(connection_id).cloned().ok_or(HubError::NotFound)
    }

    pub fn drivers(&self) -> Vec<String> {
        self.registry.list()
    }

    pub fn describe_driver(&self, name: &str) -> Option<crate::driver::registry::DriverDescriptor> {
        self.registry.describe(name)
    }
}

fn set_state(run_entry: &RunEntry, state: RunState) {
    let mut guard = run_entry.state.lock().unwrap_or_else(|e| e.into_inner());
    if !guard.is_terminal() {
        *guard = state;
    }
}

pub enum EmergencyStopTarget {
    One(String),
    All,
}
