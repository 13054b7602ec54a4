// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Safety interlock: a wrapper that treats the driver as untrusted and is
//! itself the source of truth for "is this command safe right now?".

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use futures_util::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use super::{DriverInfo, DriverStatus, Frame, FrameSource, FrameStream, Technique, Waveform};
use crate::error::HubError;

/// Immutable per-connection bounds. Per spec §3, fixed for the lifetime of a
/// connection session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SafetyLimits {
    pub voltage_min: f64,
    pub voltage_max: f64,
    pub current_min: f64,
    pub current_max: f64,
    pub max_duration_seconds: f64,
    pub stop_on_disconnect: bool,
}

impl SafetyLimits {
    fn check_voltage(&self, v: f64) -> bool {
        v < self.voltage_min || v > self.voltage_max
    }

    fn check_current(&self, i: f64) -> bool {
        i < self.current_min || i > self.current_max
    }
}

/// A single recorded safety-check failure. Per spec §3, the connection
/// session keeps a monotonic violation log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Violation {
    pub kind: String,
    pub message: String,
    pub timestamp: f64,
}

fn now_secs() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// Wraps any frame source and gates every mutating call against
/// [`SafetyLimits`]. The driver never sees a command the interlock rejects.
///
/// While a telemetry stream is in flight, the underlying driver is on loan to
/// that stream (see [`Self::stream`]); `emergency_stop` called during that
/// window takes the fast path (latch + cancellation signal, no driver call —
/// the stream observes the signal and drives the loaned driver to zero on
/// its own next iteration, comfortably inside the 100 ms budget at a 100 Hz
/// sample rate).
pub struct SafetyInterlock {
    limits: SafetyLimits,
    latched: Arc<AtomicBool>,
    violations: Arc<Mutex<Vec<Violation>>>,
    estop: CancellationToken,
    run_started_at: Mutex<Option<Instant>>,
    inner: Option<Box<dyn FrameSource>>,
}

impl SafetyInterlock {
    pub fn new(inner: Box<dyn FrameSource>, limits: SafetyLimits) -> Self {
        Self {
            limits,
            latched: Arc::new(AtomicBool::new(false)),
            violations: Arc::new(Mutex::new(Vec::new())),
            estop: CancellationToken::new(),
            run_started_at: Mutex::new(None),
            inner: Some(inner),
        }
    }

    pub fn limits(&self) -> SafetyLimits {
        self.limits
    }

    pub fn is_latched(&self) -> bool {
        self.latched.load(Ordering::SeqCst)
    }

    pub fn violations(&self) -> Vec<Violation> {
        self.violations.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn clear_violations(&self) {
        self.violations.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    /// Clears the latch. Privileged: does not replay queued commands.
    pub fn reset(&mut self) {
        self.latched.store(false, Ordering::SeqCst);
        self.estop = CancellationToken::new();
    }

    fn record(&self, kind: &str, message: impl Into<String>) {
        let message = message.into();
        error!(safety_violation = true, kind, %message, "safety interlock violation");
        self.violations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Violation { kind: kind.to_owned(), message, timestamp: now_secs() });
    }

    fn latch(&self, kind: &str, detail: String) {
        self.record(kind, detail);
        self.latched.store(true, Ordering::SeqCst);
        self.estop.cancel();
    }

    fn require_driver(&mut self) -> Result<&mut Box<dyn FrameSource>, HubError> {
        self.inner.as_mut().ok_or(HubError::Conflict)
    }

    fn validate_waveform(&self, waveform: &Waveform) -> Result<(), HubError> {
        let (lo, hi) = waveform.voltage_extrema();
        if lo < self.limits.voltage_min || hi > self.limits.voltage_max {
            return Err(HubError::SafetyViolation);
        }
        Ok(())
    }

    pub async fn connect(&mut self) -> Result<(), HubError> {
        self.require_driver()?.connect().await
    }

    pub async fn disconnect(&mut self) -> Result<(), HubError> {
        if self.limits.stop_on_disconnect {
            if let Some(driver) = self.inner.as_mut() {
                let _ = driver.emergency_stop().await;
            }
        }
        match self.inner.as_mut() {
            Some(driver) => driver.disconnect().await,
            None => Ok(()),
        }
    }

    pub async fn get_info(&self) -> DriverInfo {
        match self.inner.as_ref() {
            Some(driver) => driver.get_info().await,
            None => DriverInfo {
                name: "unknown".to_owned(),
                capabilities: vec![],
                status: DriverStatus::Running,
            },
        }
    }

    pub async fn program(&mut self, technique: Technique, waveform: Waveform) -> Result<(), HubError> {
        // Defense in depth: the interlock validates independently of the
        // driver's own `validate_waveform`.
        if let Err(e) = self.validate_waveform(&waveform) {
            self.latch("program", "waveform exceeds configured safety bounds".to_owned());
            if let Some(driver) = self.inner.as_mut() {
                let _ = driver.emergency_stop().await;
            }
            return Err(e);
        }
        if self.is_latched() {
            return Err(HubError::EmergencyStopActive);
        }
        match self.require_driver()?.program(technique, waveform).await {
            Ok(()) => Ok(()),
            Err(HubError::SafetyViolation) => {
                self.latch("program", "driver rejected waveform".to_owned());
                if let Some(driver) = self.inner.as_mut() {
                    let _ = driver.emergency_stop().await;
                }
                Err(HubError::SafetyViolation)
            }
            Err(e) => Err(e),
        }
    }

    pub async fn start(&mut self, run_id: &str) -> Result<(), HubError> {
        if self.is_latched() {
            return Err(HubError::EmergencyStopActive);
        }
        self.require_driver()?.start(run_id).await?;
        *self.run_started_at.lock().unwrap_or_else(|e| e.into_inner()) = Some(Instant::now());
        Ok(())
    }

    pub async fn pause(&mut self) -> Result<(), HubError> {
        self.require_driver()?.pause().await
    }

    pub async fn resume(&mut self) -> Result<(), HubError> {
        if self.is_latched() {
            return Err(HubError::EmergencyStopActive);
        }
        self.check_timeout()?;
        self.require_driver()?.resume().await
    }

    pub async fn stop(&mut self) -> Result<(), HubError> {
        self.require_driver()?.stop().await
    }

    /// Fast path when a stream holds the driver, full driver call otherwise.
    /// Either way returns once the latch is set and cancellation has been
    /// signalled — within the 100 ms budget spec §4.1 requires.
    pub async fn emergency_stop(&mut self) -> Result<(), HubError> {
        self.latched.store(true, Ordering::SeqCst);
        self.estop.cancel();
        match self.inner.as_mut() {
            Some(driver) => driver.emergency_stop().await,
            None => Ok(()),
        }
    }

    pub async fn set_voltage(&mut self, volts: f64) -> Result<(), HubError> {
        if self.limits.check_voltage(volts) {
            self.latch("voltage", format!("voltage {volts} out of bounds"));
            if let Some(driver) = self.inner.as_mut() {
                let _ = driver.emergency_stop().await;
            }
            return Err(HubError::SafetyViolation);
        }
        if self.is_latched() {
            return Err(HubError::EmergencyStopActive);
        }
        self.require_driver()?.set_voltage(volts).await
    }

    pub async fn set_current(&mut self, amps: f64) -> Result<(), HubError> {
        if self.limits.check_current(amps) {
            self.latch("current", format!("current {amps} out of bounds"));
            if let Some(driver) = self.inner.as_mut() {
                let _ = driver.emergency_stop().await;
            }
            return Err(HubError::SafetyViolation);
        }
        if self.is_latched() {
            return Err(HubError::EmergencyStopActive);
        }
        self.require_driver()?.set_current(amps).await
    }

    pub async fn read_once(&mut self) -> Result<Frame, HubError> {
        self.check_timeout()?;
        self.require_driver()?.read_once().await
    }

    fn check_timeout(&self) -> Result<(), HubError> {
        let elapsed = {
            let guard = self.run_started_at.lock().unwrap_or_else(|e| e.into_inner());
            guard.map(|started| started.elapsed().as_secs_f64())
        };
        let Some(elapsed) = elapsed else { return Ok(()) };
        if elapsed > self.limits.max_duration_seconds {
            self.latch("duration", format!("elapsed {elapsed:.3}s exceeds max_duration_seconds"));
            return Err(HubError::SafetyViolation);
        }
        Ok(())
    }

    /// Loans the driver to a stream for the run's duration. Returns
    /// `HubError::Conflict` if a stream is already in flight or the driver
    /// was never connected.
    pub fn stream(&mut self, run_id: String) -> Result<FrameStream, HubError> {
        if self.is_latched() {
            return Err(HubError::EmergencyStopActive);
        }
        let mut driver = self.inner.take().ok_or(HubError::Conflict)?;
        let driver_stream = driver.stream();
        let max_duration = self.limits.max_duration_seconds;
        let latched = Arc::clone(&self.latched);
        let violations = Arc::clone(&self.violations);
        let estop = self.estop.clone();

        struct State {
            driver: Box<dyn FrameSource>,
            inner: FrameStream,
            estop: CancellationToken,
            estop_handled: bool,
            latched: Arc<AtomicBool>,
            violations: Arc<Mutex<Vec<Violation>>>,
            max_duration: f64,
            run_id: String,
            done: bool,
        }

        let state = State {
            driver,
            inner: driver_stream,
            estop,
            estop_handled: false,
            latched,
            violations,
            max_duration,
            run_id,
            done: false,
        };

        Ok(Box::pin(stream::unfold(state, |mut st| async move {
            if st.done {
                return None;
            }
            if st.estop.is_cancelled() && !st.estop_handled {
                st.estop_handled = true;
                let _ = st.driver.emergency_stop().await;
                st.done = true;
                return Some((
                    Ok(Frame::status(st.run_id.clone(), "emergency-stopped", "emergency stop latched")),
                    st,
                ));
            }

            match st.inner.next().await {
                Some(Ok(frame)) if frame.elapsed_seconds > st.max_duration => {
                    warn!(run_id = %st.run_id, "max experiment duration exceeded mid-stream");
                    st.violations
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .push(Violation {
                            kind: "duration".to_owned(),
                            message: "max_experiment_duration_seconds exceeded".to_owned(),
                            timestamp: now_secs(),
                        });
                    st.latched.store(true, Ordering::SeqCst);
                    let _ = st.driver.emergency_stop().await;
                    st.done = true;
                    Some((Err(HubError::SafetyViolation), st))
                }
                Some(Ok(frame)) => Some((Ok(frame), st)),
                Some(Err(e)) => {
                    st.done = true;
                    Some((Err(e), st))
                }
                None => {
                    st.done = true;
                    None
                }
            }
        })))
    }
}
