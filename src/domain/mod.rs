//! Domain models - device telemetry
//!
//! - `TelemetrySample` - one decoded switch status report

pub mod telemetry;

pub use telemetry::TelemetrySample;
