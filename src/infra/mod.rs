//! Infrastructure - configuration, metrics, auth, and broker
//!
//! This module contains infrastructure concerns:
//! - `config` - Application configuration (env, TOML, defaults)
//! - `labels` - Constant label parsing
//! - `metrics` - Label-keyed gauge registry
//! - `auth` - Constant-time credential guard
//! - `tls` - PEM loading for the HTTP listener
//! - `broker` - Embedded MQTT broker (rumqttd)

pub mod auth;
pub mod broker;
pub mod config;
pub mod labels;
pub mod metrics;
pub mod tls;

// Re-export commonly used types
pub use auth::CredentialGuard;
pub use broker::BrokerListener;
pub use config::Config;
pub use metrics::{Gauge, MetricRegistry};
