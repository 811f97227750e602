//! IO modules - external system interfaces
//!
//! - `exposition` - Prometheus text format rendering
//! - `http` - Metrics HTTP(S) endpoint

pub mod exposition;
pub mod http;

pub use http::MetricsServer;
