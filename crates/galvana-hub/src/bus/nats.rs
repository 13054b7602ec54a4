// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! NATS-backed [`FrameBus`]. Publishes JSON-encoded frames to the same
//! `run:{run-id}:telemetry` subject [`super::topic_for_run`] names for
//! [`super::LocalBus`], and fans subscriptions out through per-call
//! `tokio::sync::broadcast` relays so the rest of the pipeline (backpressure,
//! subscriber tasks) never has to know the transport differs.

use std::sync::Mutex;

use async_trait::async_trait;
use futures_util::StreamExt;
use indexmap::IndexMap;
use tokio::sync::broadcast;
use tracing::{info, warn};

use super::{topic_for_run, FrameBus, FrameReceiver};
use crate::driver::Frame;
use crate::error::HubError;

const RELAY_CAPACITY: usize = 1024;

pub struct NatsBus {
    client: async_nats::Client,
    relays: Mutex<IndexMap<String, broadcast::Sender<Frame>>>,
}

impl NatsBus {
    pub async fn connect(url: &str) -> anyhow::Result<Self> {
        let opts = async_nats::ConnectOptions::new().retry_on_initial_connect();
        info!(url, "connecting NATS frame bus");
        let client = opts.connect(url).await?;
        info!("NATS frame bus connected");
        Ok(Self { client, relays: Mutex::new(IndexMap::new()) })
    }

    fn subject(&self, run_id: &str) -> String {
        topic_for_run(run_id)
    }

    fn relay_for(&self, run_id: &str) -> broadcast::Sender<Frame> {
        let mut relays = self.relays.lock().unwrap_or_else(|e| e.into_inner());
        relays
            .entry(run_id.to_owned())
            .or_insert_with(|| broadcast::channel(RELAY_CAPACITY).0)
            .clone()
    }
}

#[async_trait]
impl FrameBus for NatsBus {
    async fn publish(&self, run_id: &str, frame: Frame) -> Result<(), HubError> {
        let payload = serde_json::to_vec(&frame).map_err(|_| HubError::Internal)?;
        self.client
            .publish(self.subject(run_id), payload.into())
            .await
            .map_err(|_| HubError::BusUnavailable)
    }

    async fn subscribe(&self, run_id: &str) -> Result<FrameReceiver, HubError> {
        let relay = self.relay_for(run_id);
        if relay.receiver_count() == 0 {
            // First local subscriber for this run: spin up the NATS
            // subscription that feeds the relay.
            let mut sub = self
                .client
                .subscribe(self.subject(run_id))
                .await
                .map_err(|_| HubError::BusUnavailable)?;
            let relay_tx = relay.clone();
            let run_id = run_id.to_owned();
            tokio::spawn(async move {
                while let Some(msg) = sub.next().await {
                    match serde_json::from_slice::<Frame>(&msg.payload) {
                        Ok(frame) => {
                            let _ = relay_tx.send(frame);
                        }
                        Err(e) => warn!(run_id = %run_id, err = %e, "dropping malformed frame from NATS"),
                    }
                }
            });
        }
        Ok(relay.subscribe())
    }

    fn retire(&self, run_id: &str) {
        self.relays.lock().unwrap_or_else(|e| e.into_inner()).shift_remove(run_id);
    }
}
