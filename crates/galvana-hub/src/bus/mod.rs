// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Pub/sub frame bus: one topic per run (`run:{run-id}:telemetry`), fanning
//! frames out to every subscriber. The default backend is an in-process
//! [`LocalBus`]; an optional NATS-backed implementation is available behind
//! the `nats-bus` feature for multi-process deployments.

#[cfg(feature = "nats-bus")]
pub mod nats;

use std::sync::Mutex;

use async_trait::async_trait;
use indexmap::IndexMap;
use tokio::sync::broadcast;

use crate::driver::Frame;
use crate::error::HubError;

/// Default per-topic broadcast channel capacity. Subscribers that fall this
/// far behind the slowest consumer get `RecvError::Lagged`, which the
/// subscriber task treats as a hard disconnect (distinct from, and upstream
/// of, the per-subscriber backpressure queue).
const TOPIC_CAPACITY: usize = 1024;

pub fn topic_for_run(run_id: &str) -> String {
    format!("run:{run_id}:telemetry")
}

/// A handle a subscriber polls for frames on one topic.
pub type FrameReceiver = broadcast::Receiver<Frame>;

/// Publish/subscribe fabric the driver bridge publishes frames onto and
/// subscriber tasks read from. Implementations never buffer past what their
/// backend naturally provides; the backpressure controller sits downstream
/// of this trait, per subscriber.
#[async_trait]
pub trait FrameBus: Send + Sync {
    async fn publish(&self, run_id: &str, frame: Frame) -> Result<(), HubError>;
    async fn subscribe(&self, run_id: &str) -> Result<FrameReceiver, HubError>;
    /// Drops the topic once a run is known to have no further publishers.
    /// Idle subscribers observe channel closure and terminate.
    fn retire(&self, run_id: &str);
}

/// In-process bus backed by one [`broadcast::Sender`] per run, created
/// lazily on first publish or subscribe and retired when the run ends.
pub struct LocalBus {
    topics: Mutex<IndexMap<String, broadcast::Sender<Frame>>>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self { topics: Mutex::new(IndexMap::new()) }
    }

    fn sender_for(&self, run_id: &str) -> broadcast::Sender<Frame> {
        let mut topics = self.topics.lock().unwrap_or_else(|e| e.into_inner());
        topics
            .entry(run_id.to_owned())
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .clone()
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FrameBus for LocalBus {
    async fn publish(&self, run_id: &str, frame: Frame) -> Result<(), HubError> {
        let sender = self.sender_for(run_id);
        // No receivers is not an error: a run can start publishing before
        // any subscriber has connected.
        let _ = sender.send(frame);
        Ok(())
    }

    async fn subscribe(&self, run_id: &str) -> Result<FrameReceiver, HubError> {
        Ok(self.sender_for(run_id).subscribe())
    }

    fn retire(&self, run_id: &str) {
        self.topics.lock().unwrap_or_else(|e| e.into_inner()).shift_remove(run_id);
    }
}
