// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Frame source contract: the uniform interface every instrument driver (real
//! or simulated) implements, and the types that flow across it.

pub mod mock;
pub mod registry;
pub mod safety;

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::Stream;
use serde::{Deserialize, Serialize};

use crate::error::HubError;

/// A complex impedance sample, `re + im*i`. Only present on EIS frames.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Complex64 {
    pub re: f64,
    pub im: f64,
}

/// The electrochemical technique a waveform is programmed against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Technique {
    Cv,
    Ca,
    Cp,
    Eis,
    Lsv,
    Dpv,
}

impl Technique {
    /// Short code, used in capability lists (`{CV, CA, CP, EIS, LSV, DPV}`).
    pub fn code(&self) -> &'static str {
        match self {
            Self::Cv => "CV",
            Self::Ca => "CA",
            Self::Cp => "CP",
            Self::Eis => "EIS",
            Self::Lsv => "LSV",
            Self::Dpv => "DPV",
        }
    }

    /// Long form used on the wire (`technique: "cyclic_voltammetry"`).
    pub fn long_name(&self) -> &'static str {
        match self {
            Self::Cv => "cyclic_voltammetry",
            Self::Ca => "chronoamperometry",
            Self::Cp => "chronopotentiometry",
            Self::Eis => "electrochemical_impedance_spectroscopy",
            Self::Lsv => "linear_sweep_voltammetry",
            Self::Dpv => "differential_pulse_voltammetry",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        for t in [Self::Cv, Self::Ca, Self::Cp, Self::Eis, Self::Lsv, Self::Dpv] {
            if s.eq_ignore_ascii_case(t.code()) || s.eq_ignore_ascii_case(t.long_name()) {
                return Some(t);
            }
        }
        None
    }
}

impl Serialize for Technique {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.long_name())
    }
}

impl<'de> Deserialize<'de> for Technique {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Technique::parse(&raw).ok_or_else(|| serde::de::Error::custom(format!("unknown technique {raw:?}")))
    }
}

/// Waveform kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaveformKind {
    Step,
    Ramp,
    Triangle,
    Sine,
}

/// A command waveform. Not persisted; validated against safety limits before acceptance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Waveform {
    #[serde(rename = "type")]
    pub kind: WaveformKind,
    pub initial_value: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_value: Option<f64>,
    pub duration: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scan_rate: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frequency: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amplitude: Option<f64>,
}

impl Waveform {
    /// Voltage at elapsed time `t` seconds, per the waveform's kind.
    pub fn voltage_at(&self, t: f64) -> f64 {
        let t = t.max(0.0).min(self.duration.max(1e-9));
        match self.kind {
            WaveformKind::Step => {
                self.final_value.unwrap_or(self.initial_value)
            }
            WaveformKind::Ramp => {
                let end = self.final_value.unwrap_or(self.initial_value);
                let frac = t / self.duration.max(1e-9);
                self.initial_value + (end - self.initial_value) * frac
            }
            WaveformKind::Triangle => {
                let end = self.final_value.unwrap_or(-self.initial_value);
                let half = self.duration.max(1e-9) / 2.0;
                if t <= half {
                    self.initial_value + (end - self.initial_value) * (t / half)
                } else {
                    end + (self.initial_value - end) * ((t - half) / half)
                }
            }
            WaveformKind::Sine => {
                let freq = self.frequency.unwrap_or(1.0);
                let amp = self.amplitude.unwrap_or((self.final_value.unwrap_or(self.initial_value)
                    - self.initial_value)
                    .abs()
                    .max(1e-9));
                self.initial_value + amp * (2.0 * std::f64::consts::PI * freq * t).sin()
            }
        }
    }

    /// Scan rate in V/s, explicit if given, else derived from the ramp endpoints.
    pub fn scan_rate(&self) -> f64 {
        if let Some(rate) = self.scan_rate {
            return rate;
        }
        let end = self.final_value.unwrap_or(-self.initial_value);
        (end - self.initial_value).abs() / self.duration.max(1e-9)
    }

    /// Every numeric bound this waveform can expose to a voltage-range check.
    /// Mirrors `voltage_at`'s own per-kind default for an open-ended
    /// `final_value` so a safety check never disagrees with what the
    /// waveform will actually command.
    pub fn voltage_extrema(&self) -> (f64, f64) {
        match self.kind {
            WaveformKind::Sine => {
                let amp = self.amplitude.unwrap_or(0.0);
                (self.initial_value - amp, self.initial_value + amp)
            }
            WaveformKind::Triangle => {
                let end = self.final_value.unwrap_or(-self.initial_value);
                (self.initial_value.min(end), self.initial_value.max(end))
            }
            WaveformKind::Step | WaveformKind::Ramp => {
                let end = self.final_value.unwrap_or(self.initial_value);
                (self.initial_value.min(end), self.initial_value.max(end))
            }
        }
    }
}

/// Per spec §3 — operation/connectivity state of a frame source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverStatus {
    Disconnected,
    Idle,
    Running,
    Paused,
    Error,
}

/// Static description of a frame source instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverInfo {
    pub name: String,
    pub capabilities: Vec<String>,
    pub status: DriverStatus,
}

/// Message kind, per the closed set in spec §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameKind {
    Frame,
    Status,
    Log,
    Event,
}

/// The transport unit flowing from a frame source to the bus to a subscriber.
///
/// The wire shape (see [`FrameWire`]) differs from this struct in two ways:
/// `kind` travels as `type`, `elapsed_seconds` travels as `time`, and
/// `impedance` flattens into sibling `impedance_real`/`impedance_imag`
/// floats rather than a nested object.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(into = "FrameWire", from = "FrameWire")]
pub struct Frame {
    pub run_id: String,
    pub kind: FrameKind,
    pub timestep: u64,
    pub timestamp: f64,
    pub elapsed_seconds: f64,
    pub voltage: Option<f64>,
    pub current: Option<f64>,
    pub charge: Option<f64>,
    pub frequency: Option<f64>,
    pub impedance: Option<Complex64>,
    pub is_keyframe: bool,
    pub status: Option<String>,
    pub event: Option<String>,
    pub message: Option<String>,
}

/// On-the-wire shape of [`Frame`]. Deserialize accepts either the flattened
/// `impedance_real`/`impedance_imag` floats or a legacy nested
/// `impedance: {re, im}` object; serialize only ever produces the flattened
/// form. `time` similarly accepts the legacy `elapsed_seconds` key on input.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct FrameWire {
    run_id: String,
    #[serde(rename = "type")]
    kind: FrameKind,
    timestep: u64,
    timestamp: f64,
    #[serde(alias = "elapsed_seconds")]
    time: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    voltage: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    current: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    charge: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    frequency: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    impedance_real: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    impedance_imag: Option<f64>,
    #[serde(default, skip_serializing)]
    impedance: Option<Complex64>,
    is_keyframe: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    event: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

impl From<Frame> for FrameWire {
    fn from(frame: Frame) -> Self {
        Self {
            run_id: frame.run_id,
            kind: frame.kind,
            timestep: frame.timestep,
            timestamp: frame.timestamp,
            time: frame.elapsed_seconds,
            voltage: frame.voltage,
            current: frame.current,
            charge: frame.charge,
            frequency: frame.frequency,
            impedance_real: frame.impedance.map(|c| c.re),
            impedance_imag: frame.impedance.map(|c| c.im),
            impedance: None,
            is_keyframe: frame.is_keyframe,
            status: frame.status,
            event: frame.event,
            message: frame.message,
        }
    }
}

impl From<FrameWire> for Frame {
    fn from(wire: FrameWire) -> Self {
        let impedance = match (wire.impedance_real, wire.impedance_imag) {
            (Some(re), Some(im)) => Some(Complex64 { re, im }),
            _ => wire.impedance,
        };
        Self {
            run_id: wire.run_id,
            kind: wire.kind,
            timestep: wire.timestep,
            timestamp: wire.timestamp,
            elapsed_seconds: wire.time,
            voltage: wire.voltage,
            current: wire.current,
            charge: wire.charge,
            frequency: wire.frequency,
            impedance,
            is_keyframe: wire.is_keyframe,
            status: wire.status,
            event: wire.event,
            message: wire.message,
        }
    }
}

impl Frame {
    pub fn data(run_id: impl Into<String>, timestep: u64, elapsed_seconds: f64) -> Self {
        Self {
            run_id: run_id.into(),
            kind: FrameKind::Frame,
            timestep,
            timestamp: wall_clock_secs(),
            elapsed_seconds,
            voltage: None,
            current: None,
            charge: None,
            frequency: None,
            impedance: None,
            is_keyframe: false,
            status: None,
            event: None,
            message: None,
        }
    }

    pub fn status(run_id: impl Into<String>, status: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            kind: FrameKind::Status,
            timestep: 0,
            timestamp: wall_clock_secs(),
            elapsed_seconds: 0.0,
            voltage: None,
            current: None,
            charge: None,
            frequency: None,
            impedance: None,
            is_keyframe: true,
            status: Some(status.into()),
            event: None,
            message: Some(message.into()),
        }
    }

    pub fn event(run_id: impl Into<String>, event: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            kind: FrameKind::Event,
            timestep: 0,
            timestamp: wall_clock_secs(),
            elapsed_seconds: 0.0,
            voltage: None,
            current: None,
            charge: None,
            frequency: None,
            impedance: None,
            is_keyframe: true,
            status: None,
            event: Some(event.into()),
            message: Some(message.into()),
        }
    }
}

fn wall_clock_secs() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// A lazy, finite, non-restartable sequence of frames. Carries no borrow on
/// its producer: implementations extract whatever state they need into the
/// stream's own closures so the handle producing it remains independently
/// usable (in particular, so a caller can still invoke `emergency_stop` on
/// the producer while its stream is in flight).
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Frame, HubError>> + Send>>;

/// The uniform producer contract a hardware driver, a mock, or a numerical
/// solver implements. Every mutating call here is meant to sit behind a
/// [`crate::driver::safety::SafetyInterlock`] — nothing upstream of that
/// wrapper should hold a bare `dyn FrameSource`.
#[async_trait]
pub trait FrameSource: Send + Sync {
    async fn connect(&mut self) -> Result<(), HubError>;
    async fn disconnect(&mut self) -> Result<(), HubError>;
    async fn get_info(&self) -> DriverInfo;
    async fn program(&mut self, technique: Technique, waveform: Waveform) -> Result<(), HubError>;
    async fn start(&mut self, run_id: &str) -> Result<(), HubError>;
    async fn pause(&mut self) -> Result<(), HubError>;
    async fn resume(&mut self) -> Result<(), HubError>;
    async fn stop(&mut self) -> Result<(), HubError>;
    async fn emergency_stop(&mut self) -> Result<(), HubError>;
    async fn set_voltage(&mut self, volts: f64) -> Result<(), HubError>;
    async fn set_current(&mut self, amps: f64) -> Result<(), HubError>;
    async fn read_once(&mut self) -> Result<Frame, HubError>;
    /// Produces a finite stream terminating when the programmed duration
    /// elapses, the driver errors, or the stream is dropped (cancellation).
    /// Non-restartable: a second call after exhaustion yields an empty stream.
    fn stream(&mut self) -> FrameStream;
}

/// A named constructor registered with the [`registry::DriverRegistry`].
/// Implemented by anything that can build a fresh, disconnected frame source
/// from a JSON configuration blob.
pub trait FrameSourceFactory: Send + Sync {
    fn create(&self, config: &serde_json::Value) -> Result<Box<dyn FrameSource>, HubError>;
}

impl<F> FrameSourceFactory for F
where
    F: Fn(&serde_json::Value) -> Result<Box<dyn FrameSource>, HubError> + Send + Sync,
{
    fn create(&self, config: &serde_json::Value) -> Result<Box<dyn FrameSource>, HubError> {
        (self)(config)
    }
}
