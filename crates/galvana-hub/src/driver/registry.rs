// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Name-keyed table of frame source constructors. Deterministic iteration
//! order (insertion order) so `list()` is stable across calls, matching how
//! the bridge and HTTP surfaces enumerate available drivers.

use std::sync::Arc;

use indexmap::IndexMap;
use serde_json::Value;
use tracing::warn;

use super::mock::{MockConfig, MockDriver};
use super::{FrameSource, FrameSourceFactory};
use crate::config::HubConfig;
use crate::error::HubError;

#[derive(Debug, Clone, serde::Serialize)]
pub struct DriverDescriptor {
    pub name: String,
    pub capabilities: Vec<String>,
}

/// Holds constructors, not instances: every `create` call yields a fresh,
/// disconnected [`FrameSource`] so concurrent runs never share driver state.
pub struct DriverRegistry {
    factories: IndexMap<String, Arc<dyn FrameSourceFactory>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self { factories: IndexMap::new() }
    }

    /// A registry pre-populated with the built-in mock driver. `hub_config`'s
    /// sampling rate and keyframe interval become the mock's defaults; a
    /// per-connect `config` blob (`seed`, `noise_level`, `sampling_rate_hz`,
    /// `keyframe_interval`) overrides them field by field.
    pub fn with_builtins(hub_config: &HubConfig) -> Self {
        let mut registry = Self::new();
        let defaults = MockConfig {
            seed: 0,
            noise_level: 0.02,
            sampling_rate_hz: hub_config.sampling_rate_hz,
            keyframe_interval: hub_config.keyframe_interval,
        };
        // The built-in mock is the first registration into a fresh registry,
        // so it can never hit the overwrite path.
        let _ = registry.register("mock", move |config: &Value| -> Result<Box<dyn FrameSource>, HubError> {
            let mut resolved = defaults;
            if let Some(seed) = config.get("seed").and_then(Value::as_u64) {
                resolved.seed = seed;
            }
            if let Some(noise_level) = config.get("noise_level").and_then(Value::as_f64) {
                resolved.noise_level = noise_level;
            }
            if let Some(rate) = config.get("sampling_rate_hz").and_then(Value::as_f64) {
                resolved.sampling_rate_hz = rate;
            }
            if let Some(interval) = config.get("keyframe_interval").and_then(Value::as_u64) {
                resolved.keyframe_interval = interval;
            }
            Ok(Box::new(MockDriver::with_config(resolved)))
        });
        registry
    }

    /// Registers `factory` under `name`, warning (but not refusing) if a
    /// driver is already registered under that name, per the overwrite
    /// semantics of the registration surface.
    pub fn register(&mut self, name: impl Into<String>, factory: impl FrameSourceFactory + 'static) -> Result<(), HubError> {
        let name = name.into();
        if self.factories.contains_key(&name) {
            warn!(driver = %name, "overwriting an already-registered driver");
        }
        self.factories.insert(name, Arc::new(factory));
        Ok(())
    }

    pub fn unregister(&mut self, name: &str) -> bool {
        self.factories.shift_remove(name).is_some()
    }

    pub fn create(&self, name: &str, config: &Value) -> Result<Box<dyn FrameSource>, HubError> {
        let factory = self.factories.get(name).ok_or(HubError::UnknownDriver)?;
        factory.create(config)
    }

    pub fn list(&self) -> Vec<String> {
        self.factories.keys().cloned().collect()
    }

    pub fn describe(&self, name: &str) -> Option<DriverDescriptor> {
        self.factories.get(name).map(|_| DriverDescriptor {
            name: name.to_owned(),
            capabilities: MockDriver::capabilities().into_iter().map(str::to_owned).collect(),
        })
    }

    /// Plugin discovery hook. No dynamically loaded drivers exist yet, so
    /// this is a deliberate no-op kept for forward compatibility with the
    /// registration surface described in the driver interface contract.
    pub fn scan_plugins(&mut self) {}
}

impl Default for DriverRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_hub_config() -> HubConfig {
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

    #[test]
    fn builtins_register_mock_and_enumerate_it() {
        let registry = DriverRegistry::with_builtins(&test_hub_config());
        assert_eq!(registry.list(), vec!["mock".to_owned()]);
        let descriptor = registry.describe("mock").expect("mock should be registered");
        assert_eq!(descriptor.name, "mock");
    }

    #[test]
    fn create_unknown_driver_is_an_error() {
        let registry = DriverRegistry::with_builtins(&test_hub_config());
        let err = registry.create("nonexistent", &Value::Null).unwrap_err();
        assert_eq!(err, HubError::UnknownDriver);
    }

    #[test]
    fn registering_a_fresh_name_succeeds() {
        let mut registry = DriverRegistry::new();
        assert!(registry.register("mock", |_: &Value| Ok(Box::new(MockDriver::new(0, 0.0)) as Box<dyn FrameSource>)).is_ok());
        assert_eq!(registry.list(), vec!["mock".to_owned()]);
    }

    #[test]
    fn registering_over_an_existing_name_still_succeeds_but_overwrites() {
        let mut registry = DriverRegistry::new();
        assert!(registry.register("mock", |_: &Value| Ok(Box::new(MockDriver::new(0, 0.0)) as Box<dyn FrameSource>)).is_ok());
        assert!(registry.register("mock", |_: &Value| Ok(Box::new(MockDriver::new(1, 0.0)) as Box<dyn FrameSource>)).is_ok());
        assert_eq!(registry.list(), vec!["mock".to_owned()]);
    }

    #[test]
    fn unregister_removes_the_entry() {
        let mut registry = DriverRegistry::with_builtins(&test_hub_config());
        assert!(registry.unregister("mock"));
        assert!(registry.list().is_empty());
        assert!(!registry.unregister("mock"));
    }

    #[tokio::test]
    async fn hub_config_keyframe_interval_flows_into_a_fresh_mock_driver() {
        use futures_util::StreamExt;

        let mut config = test_hub_config();
        config.sampling_rate_hz = 1000.0;
        config.keyframe_interval = 1;
        let registry = DriverRegistry::with_builtins(&config);
        let mut driver = registry.create("mock", &Value::Null).expect("mock should construct");

        let waveform = crate::driver::Waveform {
            kind: crate::driver::WaveformKind::Step,
            initial_value: 0.0,
            final_value: None,
            duration: 0.01,
            scan_rate: None,
            frequency: None,
            amplitude: None,
        };
        driver.program(crate::driver::Technique::Cv, waveform).await.unwrap();
        driver.start("r1").await.unwrap();

        let frames: Vec<_> = driver.stream().collect().await;
        assert!(!frames.is_empty());
        assert!(frames.iter().all(|f| f.as_ref().unwrap().is_keyframe), "keyframe_interval=1 should mark every frame");
    }

    #[tokio::test]
    async fn per_connect_config_overrides_the_hub_default_keyframe_interval() {
        use futures_util::StreamExt;

        let mut config = test_hub_config();
        config.sampling_rate_hz = 1000.0;
        config.keyframe_interval = 10;
        let registry = DriverRegistry::with_builtins(&config);
        let mut driver = registry
            .create("mock", &serde_json::json!({ "keyframe_interval": 1 }))
            .expect("mock should construct");

        let waveform = crate::driver::Waveform {
            kind: crate::driver::WaveformKind::Step,
            initial_value: 0.0,
            final_value: None,
            duration: 0.01,
            scan_rate: None,
            frequency: None,
            amplitude: None,
        };
        driver.program(crate::driver::Technique::Cv, waveform).await.unwrap();
        driver.start("r1").await.unwrap();

        let frames: Vec<_> = driver.stream().collect().await;
        assert!(!frames.is_empty());
        assert!(frames.iter().all(|f| f.as_ref().unwrap().is_keyframe), "per-connect override should win over the hub default");
    }
}
