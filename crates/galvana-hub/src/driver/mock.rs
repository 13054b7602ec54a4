// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Deterministic, seeded potentiostat simulator. Closed-form electrochemistry
//! (Butler-Volmer + double-layer capacitance for CV, Cottrell decay for CA,
//! constant current with Gaussian noise for CP) standing in for real hardware
//! in tests and local development.

use std::time::Instant;

use async_trait::async_trait;
use futures_util::stream;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};

use super::{DriverInfo, DriverStatus, Frame, FrameSource, FrameStream, Technique, Waveform};
use crate::error::HubError;

/// Formal potential, V.
const E0: f64 = 0.2;
/// Electron count.
const N: f64 = 1.0;
/// Electrode area, cm^2.
const AREA: f64 = 0.01;
/// Diffusion coefficient, cm^2/s.
const DIFFUSION: f64 = 7.6e-6;
/// Bulk concentration, mol/cm^3 (1e-3 M == 1e-6 mol/cm^3, kept as the
/// original's raw `1e-3` "M" figure since it only ever appears as a ratio).
const C_BULK: f64 = 1e-3;
/// Standard rate constant, cm/s.
const K0: f64 = 0.01;
/// Transfer coefficient.
const ALPHA: f64 = 0.5;
/// Faraday constant, C/mol.
const FARADAY: f64 = 96485.0;
/// Gas constant, J/(mol*K).
const GAS_CONST: f64 = 8.314;
/// Temperature, K.
const TEMP: f64 = 298.0;
/// Double layer capacitance, F/cm^2.
const C_DL: f64 = 20e-6;

/// Configuration for [`MockDriver`], mirroring the original simulator's
/// constructor arguments.
#[derive(Debug, Clone, Copy)]
pub struct MockConfig {
    pub seed: u64,
    pub noise_level: f64,
    pub sampling_rate_hz: f64,
    pub keyframe_interval: u64,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self { seed: 0, noise_level: 0.02, sampling_rate_hz: 100.0, keyframe_interval: 10 }
    }
}

/// A deterministic pseudo-random frame source seeded by configuration.
pub struct MockDriver {
    config: MockConfig,
    status: DriverStatus,
    voltage: f64,
    current: f64,
    programmed: Option<(Technique, Waveform)>,
    exhausted: bool,
}

impl MockDriver {
    pub fn new(seed: u64, noise_level: f64) -> Self {
        Self::with_config(MockConfig { seed, noise_level, ..MockConfig::default() })
    }

    pub fn with_config(config: MockConfig) -> Self {
        Self {
            config,
            status: DriverStatus::Disconnected,
            voltage: 0.0,
            current: 0.0,
            programmed: None,
            exhausted: false,
        }
    }

    pub fn capabilities() -> Vec<&'static str> {
        vec!["CV", "CA", "CP", "LSV"]
    }

    fn validate_waveform(&self, waveform: &Waveform) -> Result<(), HubError> {
        // A second, independent check mirroring the interlock's own — defense
        // in depth, matching the original where both the driver and the
        // safety wrapper validate.
        if !waveform.duration.is_finite() || waveform.duration <= 0.0 {
            return Err(HubError::InvalidInput);
        }
        Ok(())
    }
}

#[async_trait]
impl FrameSource for MockDriver {
    async fn connect(&mut self) -> Result<(), HubError> {
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        self.status = DriverStatus::Idle;
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), HubError> {
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        self.status = DriverStatus::Disconnected;
        Ok(())
    }

    async fn get_info(&self) -> DriverInfo {
        DriverInfo {
            name: "mock".to_owned(),
            capabilities: Self::capabilities().into_iter().map(str::to_owned).collect(),
            status: self.status,
        }
    }

    async fn program(&mut self, technique: Technique, waveform: Waveform) -> Result<(), HubError> {
        if !matches!(technique, Technique::Cv | Technique::Ca | Technique::Cp | Technique::Lsv) {
            return Err(HubError::InvalidInput);
        }
        self.validate_waveform(&waveform)?;
        self.programmed = Some((technique, waveform));
        Ok(())
    }

    async fn start(&mut self, _run_id: &str) -> Result<(), HubError> {
        if self.programmed.is_none() {
            return Err(HubError::StartFailed);
        }
        self.status = DriverStatus::Running;
        self.exhausted = false;
        Ok(())
    }

    async fn pause(&mut self) -> Result<(), HubError> {
        self.status = DriverStatus::Paused;
        Ok(())
    }

    async fn resume(&mut self) -> Result<(), HubError> {
        self.status = DriverStatus::Running;
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), HubError> {
        self.status = DriverStatus::Idle;
        self.voltage = 0.0;
        self.current = 0.0;
        Ok(())
    }

    async fn emergency_stop(&mut self) -> Result<(), HubError> {
        self.voltage = 0.0;
        self.current = 0.0;
        self.status = DriverStatus::Error;
        Ok(())
    }

    async fn set_voltage(&mut self, volts: f64) -> Result<(), HubError> {
        self.voltage = volts;
        Ok(())
    }

    async fn set_current(&mut self, amps: f64) -> Result<(), HubError> {
        self.current = amps;
        Ok(())
    }

    async fn read_once(&mut self) -> Result<Frame, HubError> {
        let Some((technique, waveform)) = self.programmed.clone() else {
            return Err(HubError::StartFailed);
        };
        let mut rng = StdRng::seed_from_u64(self.config.seed);
        let sample = sample_at(technique, &waveform, 0.0, &mut rng, self.config.noise_level, self.current);
        Ok(Frame {
            is_keyframe: true,
            ..frame_from_sample("adhoc", 0, 0.0, sample)
        })
    }

    fn stream(&mut self) -> FrameStream {
        if self.exhausted {
            return Box::pin(stream::empty());
        }
        self.exhausted = true;

        let Some((technique, waveform)) = self.programmed.clone() else {
            return Box::pin(stream::once(async { Err(HubError::StartFailed) }));
        };

        let config = self.config;
        let sample_interval = std::time::Duration::from_secs_f64(1.0 / config.sampling_rate_hz.max(1e-6));
        let duration = waveform.duration;
        let run_current = self.current;

        struct State {
            rng: StdRng,
            started: Instant,
            timestep: u64,
            done: bool,
        }

        let state = State { rng: StdRng::seed_from_u64(config.seed), started: Instant::now(), timestep: 0, done: false };

        Box::pin(stream::unfold(state, move |mut st| {
            let waveform = waveform.clone();
            async move {
                if st.done {
                    return None;
                }
                tokio::time::sleep(sample_interval).await;
                let elapsed = st.started.elapsed().as_secs_f64();
                let sample = sample_at(technique, &waveform, elapsed, &mut st.rng, config.noise_level, run_current);
                let is_keyframe = st.timestep % config.keyframe_interval == 0 || elapsed >= duration;
                let run_id = "current".to_owned();
                let mut frame = frame_from_sample(&run_id, st.timestep, elapsed, sample);
                frame.is_keyframe = is_keyframe;
                st.timestep += 1;
                if elapsed >= duration {
                    st.done = true;
                }
                Some((Ok(frame), st))
            }
        }))
    }
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    voltage: f64,
    current: f64,
}

fn sample_at(
    technique: Technique,
    waveform: &Waveform,
    elapsed: f64,
    rng: &mut StdRng,
    noise_level: f64,
    constant_current: f64,
) -> Sample {
    let voltage = waveform.voltage_at(elapsed);
    let raw_current = match technique {
        Technique::Cv | Technique::Lsv => cv_current(voltage, waveform.scan_rate()),
        Technique::Ca => ca_current(elapsed),
        Technique::Cp => constant_current,
        Technique::Eis | Technique::Dpv => 0.0,
    };
    let noisy = add_noise(raw_current, noise_level, rng);
    Sample { voltage, current: noisy }
}

/// Butler-Volmer faradaic current (via Nernstian surface concentrations at
/// the applied overpotential) plus a capacitive term `A * C_dl * scan_rate`.
fn cv_current(voltage: f64, scan_rate: f64) -> f64 {
    let overpotential = voltage - E0;
    let exponent_ox = (1.0 - ALPHA) * N * FARADAY * overpotential / (GAS_CONST * TEMP);
    let exponent_red = -ALPHA * N * FARADAY * overpotential / (GAS_CONST * TEMP);

    // Nernstian surface concentrations, bounded to [0, C_BULK].
    let eq_ratio = (N * FARADAY * overpotential / (GAS_CONST * TEMP)).exp();
    let c_ox_surface = (C_BULK * eq_ratio / (1.0 + eq_ratio)).clamp(0.0, C_BULK);
    let c_red_surface = (C_BULK - c_ox_surface).clamp(0.0, C_BULK);

    let k0_mol = K0 / 10.0; // cm/s -> consistent units with mol/cm^3 concentrations
    let faradaic = N
        * FARADAY
        * AREA
        * k0_mol
        * (c_red_surface * exponent_ox.exp() - c_ox_surface * exponent_red.exp());

    let capacitive = AREA * C_DL * scan_rate;
    faradaic + capacitive
}

/// Cottrell equation, `i = nFAC*sqrt(D / (pi*t))`, time floored at 1 ms.
fn ca_current(elapsed: f64) -> f64 {
    let t = elapsed.max(1e-3);
    N * FARADAY * AREA * C_BULK * (DIFFUSION / (std::f64::consts::PI * t)).sqrt()
}

fn add_noise(value: f64, noise_level: f64, rng: &mut StdRng) -> f64 {
    if noise_level <= 0.0 {
        return value;
    }
    let sigma = value.abs() * noise_level;
    let Ok(normal) = Normal::new(0.0, sigma.max(1e-12)) else { return value };
    value + normal.sample(rng)
}

fn frame_from_sample(run_id: &str, timestep: u64, elapsed: f64, sample: Sample) -> Frame {
    let mut frame = Frame::data(run_id, timestep, elapsed);
    frame.voltage = Some(sample.voltage);
    frame.current = Some(sample.current);
    frame
}
