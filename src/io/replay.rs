//! Replay source for recorded drives
//!
//! Plays a JSONL file of `{offset_ms, speed_mps}` entries back on their
//! recorded schedule. Used for demos and integration tests where no
//! receiver hardware is present.

use crate::domain::types::{epoch_ms, Permission, PositionSample, SubscribeConfig};
use crate::infra::metrics::Metrics;
use crate::io::source::{LocationSource, Subscription, SAMPLE_CHANNEL_SIZE};
use anyhow::Context;
use async_trait::async_trait;
use serde::Deserialize;
use std::io::ErrorKind;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

/// One recorded sample
#[derive(Debug, Clone, Deserialize)]
pub struct ReplayEntry {
    /// Milliseconds since replay start
    pub offset_ms: u64,
    /// Ground speed in meters per second
    pub speed_mps: f64,
}

/// Plays back a recorded drive from a JSONL file
pub struct ReplaySource {
    path: String,
    loop_replay: bool,
    metrics: Option<Arc<Metrics>>,
}

impl ReplaySource {
    pub fn new(path: impl Into<String>, loop_replay: bool) -> Self {
        Self { path: path.into(), loop_replay, metrics: None }
    }

    /// Attach a metrics collector for drop counters
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    async fn probe_file(&self) -> Permission {
        match tokio::fs::File::open(&self.path).await {
            Ok(_) => Permission::Granted,
            Err(e) => match e.kind() {
                ErrorKind::PermissionDenied => Permission::DeniedForever,
                _ => Permission::Undetermined,
            },
        }
    }

    async fn load_entries(&self) -> anyhow::Result<Vec<ReplayEntry>> {
        let raw = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("Failed to read replay file {}", self.path))?;

        let mut entries = Vec::new();
        for (i, line) in raw.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let entry: ReplayEntry = serde_json::from_str(line)
                .with_context(|| format!("Failed to parse replay line {}", i + 1))?;
            entries.push(entry);
        }

        Ok(entries)
    }
}

#[async_trait]
impl LocationSource for ReplaySource {
    fn kind(&self) -> &'static str {
        "replay"
    }

    async fn is_service_enabled(&self) -> bool {
        tokio::fs::metadata(&self.path).await.is_ok()
    }

    async fn permission_status(&self) -> Permission {
        self.probe_file().await
    }

    async fn request_permission(&self) -> Permission {
        self.probe_file().await
    }

    async fn subscribe(&self, _config: SubscribeConfig) -> anyhow::Result<Subscription> {
        // Load and validate the whole file before spawning anything
        let entries = self.load_entries().await?;

        let (tx, rx) = mpsc::channel(SAMPLE_CHANNEL_SIZE);
        let (cancel_tx, cancel_rx) = watch::channel(false);

        let player = ReplayPlayer {
            entries,
            loop_replay: self.loop_replay,
            metrics: self.metrics.clone(),
        };
        tokio::spawn(player.run(tx, cancel_rx));

        Ok(Subscription::new(rx, cancel_tx))
    }
}

struct ReplayPlayer {
    entries: Vec<ReplayEntry>,
    loop_replay: bool,
    metrics: Option<Arc<Metrics>>,
}

impl ReplayPlayer {
    async fn run(self, tx: mpsc::Sender<PositionSample>, mut cancel: watch::Receiver<bool>) {
        info!(
            entries = %self.entries.len(),
            loop_replay = %self.loop_replay,
            "replay_started"
        );

        loop {
            let start = Instant::now();

            for entry in &self.entries {
                if *cancel.borrow() {
                    info!("replay_cancelled");
                    return;
                }

                // Hold each entry until its recorded offset
                let due = Duration::from_millis(entry.offset_ms);
                let elapsed = start.elapsed();
                if due > elapsed {
                    tokio::select! {
                        _ = tokio::time::sleep(due - elapsed) => {}
                        _ = cancel.changed() => {
                            if *cancel.borrow() {
                                info!("replay_cancelled");
                                return;
                            }
                        }
                    }
                }

                let sample = PositionSample {
                    speed_mps: entry.speed_mps,
                    fix_time_ms: Some(epoch_ms()),
                    received_at: Instant::now(),
                };

                match tx.try_send(sample) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        if let Some(m) = &self.metrics {
                            m.record_sample_dropped();
                        }
                        warn!("replay_sample_dropped_channel_full");
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        info!("replay_receiver_gone");
                        return;
                    }
                }
            }

            if !self.loop_replay {
                break;
            }
        }

        info!("replay_complete");
    }
}
