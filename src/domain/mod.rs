//! Domain models - core types shared across layers
//!
//! This module contains the canonical data types used throughout the system:
//! - `PositionSample` - one speed reading from the location source
//! - `MonitorState` - derived speed/overspeed state
//! - `RenderFrame` - snapshot handed to the presentation surface
//! - `Permission` / `PermissionStatus` - platform permission space and gate outcome
//! - `AccuracyTier` / `SubscribeConfig` - position subscription options

pub mod types;

// Re-export commonly used types at module level
pub use types::{
    epoch_ms, is_limit_option, new_session_id, AccuracyTier, MonitorCommand, MonitorState,
    Permission, PermissionStatus, PositionSample, RenderFrame, SubscribeConfig, LIMIT_OPTIONS_KMH,
};
