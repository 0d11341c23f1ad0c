//! Shared types for the speed monitor

use serde::Deserialize;
use std::time::Instant;
use uuid::Uuid;

/// Current time as epoch milliseconds
pub fn epoch_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Time-ordered unique id for one monitor session
pub fn new_session_id() -> String {
    Uuid::now_v7().to_string()
}

/// Speed limit options offered to the driver, in km/h
pub const LIMIT_OPTIONS_KMH: [f64; 5] = [30.0, 50.0, 80.0, 100.0, 120.0];

/// True if `kmh` is one of the selectable limit options
pub fn is_limit_option(kmh: f64) -> bool {
    LIMIT_OPTIONS_KMH.iter().any(|&opt| opt == kmh)
}

/// Platform-side permission state as reported by a location source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    Undetermined,
    Denied,
    DeniedForever,
    Granted,
}

impl Permission {
    pub fn as_str(&self) -> &str {
        match self {
            Permission::Undetermined => "undetermined",
            Permission::Denied => "denied",
            Permission::DeniedForever => "denied_forever",
            Permission::Granted => "granted",
        }
    }
}

/// Outcome of the startup permission gate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionStatus {
    /// Gate has not run yet
    Unknown,
    /// Location service switched off at the platform level
    ServiceDisabled,
    Denied,
    DeniedForever,
    Granted,
}

impl PermissionStatus {
    pub fn as_str(&self) -> &str {
        match self {
            PermissionStatus::Unknown => "unknown",
            PermissionStatus::ServiceDisabled => "service_disabled",
            PermissionStatus::Denied => "denied",
            PermissionStatus::DeniedForever => "denied_forever",
            PermissionStatus::Granted => "granted",
        }
    }

    /// Stable numeric code for the metrics gauge
    pub fn code(&self) -> u64 {
        match self {
            PermissionStatus::Unknown => 0,
            PermissionStatus::ServiceDisabled => 1,
            PermissionStatus::Denied => 2,
            PermissionStatus::DeniedForever => 3,
            PermissionStatus::Granted => 4,
        }
    }
}

/// One reading from the location source
#[derive(Debug, Clone, Copy)]
pub struct PositionSample {
    /// Ground speed in meters per second; may be negative or noisy near zero
    pub speed_mps: f64,
    /// Receiver fix time as epoch milliseconds, when the sentence carried one
    pub fix_time_ms: Option<u64>,
    pub received_at: Instant,
}

impl PositionSample {
    pub fn new(speed_mps: f64) -> Self {
        Self { speed_mps, fix_time_ms: None, received_at: Instant::now() }
    }
}

/// Derived monitor state
///
/// `speeding` is always a function of the held speed and limit; it is
/// recomputed on every read and never stored on its own.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MonitorState {
    pub speed_kmh: f64,
    pub speeding: bool,
}

/// Snapshot published to the presentation surface after every state change
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RenderFrame {
    pub state: MonitorState,
    pub status: PermissionStatus,
    pub limit_kmh: f64,
}

/// Commands from the presentation surface into the monitor loop
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MonitorCommand {
    SetLimit(f64),
}

/// Requested fix quality for a subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccuracyTier {
    Low,
    Balanced,
    High,
    #[default]
    Best,
}

impl AccuracyTier {
    pub fn as_str(&self) -> &str {
        match self {
            AccuracyTier::Low => "low",
            AccuracyTier::Balanced => "balanced",
            AccuracyTier::High => "high",
            AccuracyTier::Best => "best",
        }
    }
}

/// Delivery options for a position subscription
#[derive(Debug, Clone, Copy)]
pub struct SubscribeConfig {
    pub accuracy: AccuracyTier,
    /// Minimum movement between delivered samples; 0.0 delivers every update
    pub min_distance_m: f64,
}

impl Default for SubscribeConfig {
    fn default() -> Self {
        Self { accuracy: AccuracyTier::Best, min_distance_m: 0.0 }
    }
}
