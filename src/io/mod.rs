//! IO modules - external system interfaces
//!
//! This module contains all external IO operations:
//! - `source` - the `LocationSource` trait and subscription handle
//! - `nmea` - NMEA-0183 serial GPS source
//! - `replay` - JSONL replay source for development and demos
//! - `prometheus` - Prometheus metrics HTTP endpoint

pub mod nmea;
pub mod prometheus;
pub mod replay;
pub mod source;

// Re-export commonly used types
pub use nmea::NmeaSource;
pub use replay::ReplaySource;
pub use source::{build_source, LocationSource, Subscription};
