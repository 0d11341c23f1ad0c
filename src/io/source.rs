//! Location source abstraction
//!
//! A `LocationSource` is the pluggable backend the monitor reads speed from.
//! It answers the service and permission queries used by the startup gate and
//! hands out a cancellable `Subscription` carrying position samples.
//! Implementations must be `Send + Sync` so the selected backend can be held
//! as a `Box<dyn LocationSource>`.

use crate::domain::{Permission, PositionSample, SubscribeConfig};
use crate::infra::config::{Config, SourceKind};
use crate::infra::metrics::Metrics;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

/// Buffered samples per subscription before the producer starts dropping
pub const SAMPLE_CHANNEL_SIZE: usize = 64;

#[async_trait]
pub trait LocationSource: Send + Sync {
    /// Short backend name for logs ("nmea", "replay")
    fn kind(&self) -> &'static str;

    /// Whether the underlying location service is available at all
    async fn is_service_enabled(&self) -> bool;

    /// Current platform permission, without prompting
    async fn permission_status(&self) -> Permission;

    /// One-shot permission request. Headless backends cannot prompt anyone,
    /// so they re-probe and report the outcome.
    async fn request_permission(&self) -> Permission;

    /// Start the position stream
    async fn subscribe(&self, config: SubscribeConfig) -> anyhow::Result<Subscription>;
}

/// Receiving half of a position stream
///
/// Owns the cancel signal for the producer task. Dropping the handle signals
/// the producer, so the underlying device is released on every exit path -
/// explicit cancel, normal teardown, or an error unwinding the owner.
#[derive(Debug)]
pub struct Subscription {
    rx: mpsc::Receiver<PositionSample>,
    cancel_tx: watch::Sender<bool>,
}

impl Subscription {
    pub(crate) fn new(rx: mpsc::Receiver<PositionSample>, cancel_tx: watch::Sender<bool>) -> Self {
        Self { rx, cancel_tx }
    }

    /// Next sample; `None` once the producer has stopped
    pub async fn recv(&mut self) -> Option<PositionSample> {
        self.rx.recv().await
    }

    /// Stop the producer without waiting for the handle to drop
    pub fn cancel(&self) {
        let _ = self.cancel_tx.send(true);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let _ = self.cancel_tx.send(true);
    }
}

/// Build the location source selected in config
pub fn build_source(config: &Config, metrics: Arc<Metrics>) -> Box<dyn LocationSource> {
    match config.source_kind() {
        SourceKind::Nmea => Box::new(
            crate::io::nmea::NmeaSource::new(config.source_device(), config.source_baud())
                .with_metrics(metrics),
        ),
        SourceKind::Replay => Box::new(
            crate::io::replay::ReplaySource::new(config.replay_file(), config.replay_loop())
                .with_metrics(metrics),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscription_delivers_samples() {
        let (tx, rx) = mpsc::channel(4);
        let (cancel_tx, _cancel_rx) = watch::channel(false);
        let mut sub = Subscription::new(rx, cancel_tx);

        tx.send(PositionSample::new(5.0)).await.unwrap();
        let sample = sub.recv().await.unwrap();
        assert_eq!(sample.speed_mps, 5.0);

        drop(tx);
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_drop_signals_cancel() {
        let (_tx, rx) = mpsc::channel::<PositionSample>(4);
        let (cancel_tx, mut cancel_rx) = watch::channel(false);
        let sub = Subscription::new(rx, cancel_tx);

        drop(sub);

        cancel_rx.changed().await.unwrap();
        assert!(*cancel_rx.borrow());
    }

    #[tokio::test]
    async fn test_explicit_cancel_signals_producer() {
        let (_tx, rx) = mpsc::channel::<PositionSample>(4);
        let (cancel_tx, mut cancel_rx) = watch::channel(false);
        let sub = Subscription::new(rx, cancel_tx);

        sub.cancel();

        cancel_rx.changed().await.unwrap();
        assert!(*cancel_rx.borrow());
    }

    #[tokio::test]
    async fn test_build_source_dispatches_on_kind() {
        let config = Config::default();
        let source = build_source(&config, Arc::new(Metrics::new()));
        assert_eq!(source.kind(), "nmea");
    }
}
