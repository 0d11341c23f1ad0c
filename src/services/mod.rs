//! Services - business logic and state management
//!
//! This module contains the core business logic services:
//! - `evaluator` - pure speed evaluation against the selected limit
//! - `permission` - startup permission gate for the location source
//! - `monitor` - run loop consuming samples and limit commands

pub mod evaluator;
pub mod monitor;
pub mod permission;

// Re-export commonly used types
pub use evaluator::SpeedEvaluator;
pub use monitor::Monitor;
pub use permission::check_and_request;
