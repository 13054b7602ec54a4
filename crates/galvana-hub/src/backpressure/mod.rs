// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-subscriber backpressure: a bounded queue with three fan-out regimes
//! keyed off utilization (FAST < 30%, MEDIUM 30-70%, SLOW > 70%), dropping
//! non-keyframes before timing out on enqueue when a client has fully
//! stalled. Keeps a slow WebSocket consumer from growing the process's
//! memory without bound, at the cost of the data that consumer never sees.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::driver::Frame;

/// Regime a subscriber's queue currently falls into, by utilization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Regime {
    Fast,
    Medium,
    Slow,
    Stalled,
}

#[derive(Debug, Clone, Copy)]
pub struct BackpressureThresholds {
    pub medium: f64,
    pub slow: f64,
    pub enqueue_timeout: Duration,
    pub warning_cooldown: Duration,
}

impl Default for BackpressureThresholds {
    fn default() -> Self {
        Self {
            medium: 0.3,
            slow: 0.7,
            enqueue_timeout: Duration::from_secs(1),
            warning_cooldown: Duration::from_secs(5),
        }
    }
}

/// Point-in-time statistics for one subscriber's queue.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct FrameQueueMetrics {
    pub queue_size: usize,
    pub max_size: usize,
    pub utilization: f64,
    pub frames_dropped: u64,
    pub frames_transmitted: u64,
    pub keyframes_preserved: u64,
    /// Mean enqueue-to-dequeue latency across every frame transmitted so
    /// far, in seconds.
    pub mean_latency_seconds: f64,
}

/// A frame paired with the instant it was accepted onto the queue, so the
/// egester can compute dequeue latency before the frame ever reaches the
/// socket. The timestamp never leaves this module.
struct Enqueued {
    frame: Frame,
    enqueued_at: Instant,
}

/// Gates frames onto a bounded mpsc channel for exactly one subscriber,
/// classifying fan-out health into [`Regime`]s and dropping non-keyframes
/// before ever blocking a producer past `enqueue_timeout`.
pub struct BackpressureController {
    run_id: String,
    max_queue_size: usize,
    thresholds: BackpressureThresholds,
    sender: mpsc::Sender<Enqueued>,
    receiver: Mutex<Option<mpsc::Receiver<Enqueued>>>,
    frames_dropped: AtomicU64,
    frames_transmitted: AtomicU64,
    keyframes_preserved: AtomicU64,
    latency_count: AtomicU64,
    latency_sum_micros: AtomicU64,
    last_warning: Mutex<Option<Instant>>,
}

impl BackpressureController {
    pub fn new(run_id: impl Into<String>, max_queue_size: usize, thresholds: BackpressureThresholds) -> Self {
        let (sender, receiver) = mpsc::channel(max_queue_size.max(1));
        Self {
            run_id: run_id.into(),
            max_queue_size: max_queue_size.max(1),
            thresholds,
            sender,
            receiver: Mutex::new(Some(receiver)),
            frames_dropped: AtomicU64::new(0),
            frames_transmitted: AtomicU64::new(0),
            keyframes_preserved: AtomicU64::new(0),
            latency_count: AtomicU64::new(0),
            latency_sum_micros: AtomicU64::new(0),
            last_warning: Mutex::new(None),
        }
    }

    /// `queue_len / max_queue_size`, approximated from the sender's
    /// remaining permits since `tokio::sync::mpsc` has no direct length
    /// accessor.
    pub fn utilization(&self) -> f64 {
        let available = self.sender.capacity();
        let used = self.max_queue_size.saturating_sub(available);
        used as f64 / self.max_queue_size as f64
    }

    pub fn regime(&self) -> Regime {
        let utilization = self.utilization();
        if utilization >= 1.0 {
            Regime::Stalled
        } else if utilization > self.thresholds.slow {
            Regime::Slow
        } else if utilization > self.thresholds.medium {
            Regime::Medium
        } else {
            Regime::Fast
        }
    }

    fn should_warn(&self) -> bool {
        let mut last = self.last_warning.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        let should = match *last {
            None => true,
            Some(prev) => now.duration_since(prev) > self.thresholds.warning_cooldown,
        };
        if should {
            *last = Some(now);
        }
        should
    }

    /// Enqueues `frame`, applying the drop-before-enqueue rule: a non-
    /// keyframe offered while the queue is already in the SLOW regime is
    /// rejected without ever touching the channel, so the queue itself
    /// never grows past the point that triggered the classification.
    /// Keyframes are always attempted, bounded by `enqueue_timeout` once
    /// the channel is actually full.
    pub async fn enqueue(&self, frame: Frame) -> bool {
        let regime = self.regime();
        let is_keyframe = frame.is_keyframe;

        if regime == Regime::Slow && !is_keyframe {
            self.frames_dropped.fetch_add(1, Ordering::Relaxed);
            if self.should_warn() {
                warn!(
                    run_id = %self.run_id,
                    utilization = self.utilization(),
                    "dropping non-keyframe, queue in slow regime"
                );
            }
            return false;
        }

        let enqueued = Enqueued { frame, enqueued_at: Instant::now() };
        match timeout(self.thresholds.enqueue_timeout, self.sender.send(enqueued)).await {
            Ok(Ok(())) => {
                if is_keyframe {
                    self.keyframes_preserved.fetch_add(1, Ordering::Relaxed);
                }
                if regime == Regime::Medium && self.should_warn() {
                    info!(run_id = %self.run_id, utilization = self.utilization(), "queue approaching backpressure threshold");
                }
                true
            }
            Ok(Err(_)) => {
                debug!(run_id = %self.run_id, "subscriber channel closed, frame discarded");
                false
            }
            Err(_) => {
                self.frames_dropped.fetch_add(1, Ordering::Relaxed);
                error!(run_id = %self.run_id, "frame dropped, enqueue timed out (stalled client)");
                false
            }
        }
    }

    /// Takes ownership of the receiving half, paired with a dequeue function
    /// that strips the internal enqueue timestamp, records transmit latency,
    /// and hands back the bare [`Frame`] the socket actually writes.
    /// Callable exactly once; a second call returns `None`, matching the
    /// one-subscriber-per-queue design (fan-out across multiple WebSocket
    /// clients is one controller per client, not one receiver shared across
    /// clients).
    pub fn take_receiver(&self) -> Option<FrameQueueReceiver> {
        self.receiver.lock().unwrap_or_else(|e| e.into_inner()).take().map(FrameQueueReceiver)
    }

    /// Records one frame's dequeue-to-transmit event and its queueing
    /// latency (enqueue to dequeue), folding it into the running mean.
    fn record_dequeued(&self, enqueued_at: Instant) {
        self.frames_transmitted.fetch_add(1, Ordering::Relaxed);
        let latency_micros = enqueued_at.elapsed().as_micros().min(u128::from(u64::MAX)) as u64;
        self.latency_sum_micros.fetch_add(latency_micros, Ordering::Relaxed);
        self.latency_count.fetch_add(1, Ordering::Relaxed);
    }

    fn mean_latency_seconds(&self) -> f64 {
        let count = self.latency_count.load(Ordering::Relaxed);
        if count == 0 {
            return 0.0;
        }
        let sum_micros = self.latency_sum_micros.load(Ordering::Relaxed);
        (sum_micros as f64 / count as f64) / 1_000_000.0
    }

    pub fn metrics(&self) -> FrameQueueMetrics {
        let available = self.sender.capacity();
        let queue_size = self.max_queue_size.saturating_sub(available);
        FrameQueueMetrics {
            queue_size,
            max_size: self.max_queue_size,
            utilization: self.utilization(),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            frames_transmitted: self.frames_transmitted.load(Ordering::Relaxed),
            keyframes_preserved: self.keyframes_preserved.load(Ordering::Relaxed),
            mean_latency_seconds: self.mean_latency_seconds(),
        }
    }
}

/// Receiving half handed to an egester task. Wraps the raw `mpsc::Receiver`
/// so callers can never observe an [`Enqueued`] frame's timestamp directly;
/// `recv` strips it after recording latency against the owning controller.
pub struct FrameQueueReceiver(mpsc::Receiver<Enqueued>);

impl FrameQueueReceiver {
    pub async fn recv(&mut self, controller: &BackpressureController) -> Option<Frame> {
        let Enqueued { frame, enqueued_at } = self.0.recv().await?;
        controller.record_dequeued(enqueued_at);
        Some(frame)
    }
}

/// System-wide aggregate across every active controller, matching the
/// dropped/(dropped+transmitted) bandwidth-efficiency figure. Registration
/// is by weak reference: a controller that is dropped without being
/// explicitly unregistered simply stops contributing.
pub struct BackpressureMonitor {
    controllers: Mutex<Vec<std::sync::Weak<BackpressureController>>>,
}

impl BackpressureMonitor {
    pub fn new() -> Self {
        Self { controllers: Mutex::new(Vec::new()) }
    }

    pub fn register(&self, controller: &std::sync::Arc<BackpressureController>) {
        self.controllers.lock().unwrap_or_else(|e| e.into_inner()).push(std::sync::Arc::downgrade(controller));
    }

    pub fn global_metrics(&self) -> GlobalBackpressureMetrics {
        let mut controllers = self.controllers.lock().unwrap_or_else(|e| e.into_inner());
        controllers.retain(|weak| weak.strong_count() > 0);

        let mut total_dropped = 0u64;
        let mut total_transmitted = 0u64;
        let mut total_keyframes = 0u64;
        let mut utilization_sum = 0.0;
        let mut active = 0usize;

        for weak in controllers.iter() {
            if let Some(controller) = weak.upgrade() {
                let m = controller.metrics();
                total_dropped += m.frames_dropped;
                total_transmitted += m.frames_transmitted;
                total_keyframes += m.keyframes_preserved;
                utilization_sum += m.utilization;
                active += 1;
            }
        }

        let denom = total_dropped + total_transmitted;
        GlobalBackpressureMetrics {
            active_runs: active,
            total_frames_transmitted: total_transmitted,
            total_frames_dropped: total_dropped,
            total_keyframes_preserved: total_keyframes,
            average_queue_utilization: if active > 0 { utilization_sum / active as f64 } else { 0.0 },
            bandwidth_efficiency: if denom > 0 { total_dropped as f64 / denom as f64 } else { 0.0 },
        }
    }
}

impl Default for BackpressureMonitor {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct GlobalBackpressureMetrics {
    pub active_runs: usize,
    pub total_frames_transmitted: u64,
    pub total_frames_dropped: u64,
    pub total_keyframes_preserved: u64,
    pub average_queue_utilization: f64,
    pub bandwidth_efficiency: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::FrameKind;

    fn frame(is_keyframe: bool) -> Frame {
        Frame {
            run_id: "r1".to_owned(),
            kind: FrameKind::Frame,
            timestep: 0,
            timestamp: 0.0,
            elapsed_seconds: 0.0,
            voltage: None,
            current: None,
            charge: None,
            frequency: None,
            impedance: None,
            is_keyframe,
            status: None,
            event: None,
            message: None,
        }
    }

    #[tokio::test]
    async fn fast_regime_enqueues_everything() {
        let controller = BackpressureController::new("r1", 10, BackpressureThresholds::default());
        assert!(controller.enqueue(frame(false)).await);
        assert_eq!(controller.regime(), Regime::Fast);
    }

    #[tokio::test]
    async fn slow_regime_drops_non_keyframes_but_keeps_keyframes() {
        let thresholds = BackpressureThresholds { slow: 0.2, medium: 0.1, ..BackpressureThresholds::default() };
        let controller = BackpressureController::new("r1", 10, thresholds);
        // Fill past the slow threshold (20% of 10 == 2 frames).
        for _ in 0..3 {
            controller.enqueue(frame(false)).await;
        }
        assert_eq!(controller.regime(), Regime::Slow);

        let dropped = !controller.enqueue(frame(false)).await;
        assert!(dropped);

        let kept = controller.enqueue(frame(true)).await;
        assert!(kept);
        assert_eq!(controller.metrics().keyframes_preserved, 1);
    }

    #[tokio::test]
    async fn bandwidth_efficiency_reflects_dropped_over_total() {
        let monitor = BackpressureMonitor::new();
        let thresholds = BackpressureThresholds { enqueue_timeout: Duration::from_millis(20), ..BackpressureThresholds::default() };
        let controller = std::sync::Arc::new(BackpressureController::new("r1", 1, thresholds));
        monitor.register(&controller);

        let mut receiver = controller.take_receiver().unwrap();
        controller.enqueue(frame(false)).await;
        receiver.recv(&controller).await;
        // Queue of size 1 is now full; a second non-keyframe send should
        // either be dropped by regime classification or time out.
        controller.enqueue(frame(false)).await;

        let metrics = monitor.global_metrics();
        assert_eq!(metrics.active_runs, 1);
        assert!(metrics.bandwidth_efficiency >= 0.0);
        assert!(metrics.total_frames_transmitted >= 1);
    }

    #[tokio::test]
    async fn dequeuing_a_frame_records_nonzero_mean_latency() {
        let controller = BackpressureController::new("r1", 10, BackpressureThresholds::default());
        let mut receiver = controller.take_receiver().unwrap();
        controller.enqueue(frame(false)).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        let received = receiver.recv(&controller).await;
        assert!(received.is_some());
        assert!(controller.metrics().mean_latency_seconds > 0.0);
    }
}
