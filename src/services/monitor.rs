//! Monitor run loop
//!
//! Single consumer for position samples and limit commands, so every
//! state transition is strictly ordered. Each processed event re-derives
//! the overspeed state and publishes a fresh frame to the presentation
//! surface via a watch channel.

use crate::domain::types::{
    new_session_id, MonitorCommand, PermissionStatus, PositionSample, RenderFrame,
};
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use crate::io::source::Subscription;
use crate::services::evaluator::{SpeedEvaluator, MPS_TO_KMH, NOISE_FLOOR_KMH};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::info;

pub struct Monitor {
    evaluator: SpeedEvaluator,
    status: PermissionStatus,
    session_id: String,
    metrics: Arc<Metrics>,
    frame_tx: watch::Sender<RenderFrame>,
}

impl Monitor {
    /// Build a monitor with the configured default limit. Returns the
    /// frame receiver the presentation surface renders from.
    pub fn new(config: &Config, metrics: Arc<Metrics>) -> (Self, watch::Receiver<RenderFrame>) {
        let evaluator = SpeedEvaluator::new(config.default_limit_kmh());
        let initial = RenderFrame {
            state: evaluator.state(),
            status: PermissionStatus::Unknown,
            limit_kmh: evaluator.limit_kmh(),
        };
        let (frame_tx, frame_rx) = watch::channel(initial);

        metrics.set_limit_kmh(evaluator.limit_kmh());

        let monitor = Self {
            evaluator,
            status: PermissionStatus::Unknown,
            session_id: new_session_id(),
            metrics,
            frame_tx,
        };
        (monitor, frame_rx)
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Record the permission gate outcome and publish it
    pub fn set_permission(&mut self, status: PermissionStatus) {
        self.status = status;
        self.metrics.set_permission_state(status.code());
        self.publish();
    }

    /// Run until shutdown. A missing subscription (permission not granted)
    /// still serves limit commands; a sample stream that ends mid-session
    /// does the same.
    pub async fn run(
        mut self,
        mut samples: Option<Subscription>,
        mut commands: mpsc::Receiver<MonitorCommand>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(
            session = %self.session_id,
            limit_kmh = %self.evaluator.limit_kmh(),
            has_stream = %samples.is_some(),
            "monitor_started"
        );

        let mut commands_open = true;

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                sample = recv_sample(&mut samples) => {
                    match sample {
                        Some(sample) => self.handle_sample(sample),
                        None => {
                            info!(session = %self.session_id, "sample_stream_ended");
                            samples = None;
                        }
                    }
                }
                command = commands.recv(), if commands_open => {
                    match command {
                        Some(command) => self.handle_command(command),
                        None => commands_open = false,
                    }
                }
            }
        }

        // Dropping the subscription cancels the producer, so the source
        // is released on every exit path
        drop(samples);
        info!(session = %self.session_id, "monitor_stopped");
    }

    fn handle_sample(&mut self, sample: PositionSample) {
        let was_speeding = self.evaluator.state().speeding;
        let state = self.evaluator.on_sample(sample.speed_mps);

        // Count readings the noise floor snapped to standstill
        let raw_kmh = sample.speed_mps * MPS_TO_KMH;
        if (raw_kmh < NOISE_FLOOR_KMH || raw_kmh.is_nan()) && raw_kmh != 0.0 {
            self.metrics.record_sample_clamped();
        }

        let latency_us = sample.received_at.elapsed().as_micros() as u64;
        self.metrics.record_sample(latency_us);
        self.metrics.set_speed_kmh(state.speed_kmh);
        self.metrics.set_speeding(state.speeding);

        if state.speeding && !was_speeding {
            self.metrics.record_overspeed_transition();
            info!(
                session = %self.session_id,
                speed_kmh = format!("{:.1}", state.speed_kmh),
                limit_kmh = format!("{:.0}", self.evaluator.limit_kmh()),
                "overspeed_started"
            );
        } else if !state.speeding && was_speeding {
            info!(
                session = %self.session_id,
                speed_kmh = format!("{:.1}", state.speed_kmh),
                limit_kmh = format!("{:.0}", self.evaluator.limit_kmh()),
                "overspeed_ended"
            );
        } else {
            // Routine samples log at trace to avoid spam at receiver rate
            tracing::trace!(
                speed_kmh = format!("{:.1}", state.speed_kmh),
                latency_us = %latency_us,
                "sample_evaluated"
            );
        }

        self.publish();
    }

    fn handle_command(&mut self, command: MonitorCommand) {
        match command {
            MonitorCommand::SetLimit(limit_kmh) => {
                let was_speeding = self.evaluator.state().speeding;
                let state = self.evaluator.set_limit(limit_kmh);

                self.metrics.record_limit_change();
                self.metrics.set_limit_kmh(limit_kmh);
                self.metrics.set_speeding(state.speeding);
                if state.speeding && !was_speeding {
                    self.metrics.record_overspeed_transition();
                }

                info!(
                    session = %self.session_id,
                    limit_kmh = %limit_kmh,
                    speeding = %state.speeding,
                    "limit_changed"
                );

                self.publish();
            }
        }
    }

    fn publish(&self) {
        let frame = RenderFrame {
            state: self.evaluator.state(),
            status: self.status,
            limit_kmh: self.evaluator.limit_kmh(),
        };
        self.frame_tx.send_replace(frame);
    }
}

/// Pending forever when there is no subscription, so the select loop
/// stays responsive to commands and shutdown
async fn recv_sample(samples: &mut Option<Subscription>) -> Option<PositionSample> {
    match samples {
        Some(sub) => sub.recv().await,
        None => std::future::pending().await,
    }
}
