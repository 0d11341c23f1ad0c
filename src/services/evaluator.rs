//! Speed evaluation against the selected limit
//!
//! Pure, synchronous core: converts raw m/s readings to km/h, applies the
//! standstill noise floor, and derives the overspeed flag. The flag is never
//! stored - it is recomputed from the held speed and limit on every read.

use crate::domain::MonitorState;

/// Conversion factor from meters per second to kilometers per hour
pub const MPS_TO_KMH: f64 = 3.6;

/// Readings below this are treated as standstill jitter (km/h)
pub const NOISE_FLOOR_KMH: f64 = 1.0;

/// Holds the last evaluated speed and the selected limit
#[derive(Debug, Clone)]
pub struct SpeedEvaluator {
    speed_kmh: f64,
    limit_kmh: f64,
}

impl SpeedEvaluator {
    pub fn new(limit_kmh: f64) -> Self {
        Self { speed_kmh: 0.0, limit_kmh }
    }

    /// Evaluate one raw reading in m/s and return the new state
    pub fn on_sample(&mut self, speed_mps: f64) -> MonitorState {
        let speed_kmh = speed_mps * MPS_TO_KMH;

        // The comparison is false for NaN and negative readings, so anything
        // that is not a clean above-floor speed snaps to 0.0.
        self.speed_kmh = if speed_kmh >= NOISE_FLOOR_KMH { speed_kmh } else { 0.0 };

        self.state()
    }

    /// Change the limit and re-derive the flag from the held speed.
    /// Does not require a new sample.
    pub fn set_limit(&mut self, limit_kmh: f64) -> MonitorState {
        self.limit_kmh = limit_kmh;
        self.state()
    }

    /// Current derived state; overspeed means strictly above the limit
    pub fn state(&self) -> MonitorState {
        MonitorState { speed_kmh: self.speed_kmh, speeding: self.speed_kmh > self.limit_kmh }
    }

    pub fn limit_kmh(&self) -> f64 {
        self.limit_kmh
    }
}
