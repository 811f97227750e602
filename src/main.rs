//! Shelly exporter - MQTT to Prometheus bridge for Shelly smart plugs
//!
//! Devices publish `<device>/status/switch:<n>` to the embedded broker;
//! the latest readings are served as gauges on the metrics endpoint.
//!
//! Module structure:
//! - `domain/` - Telemetry payload model
//! - `io/` - Metrics HTTP endpoint and text exposition
//! - `services/` - Topic routing, lifecycle coordination
//! - `infra/` - Config, metric registry, auth, TLS, broker

use anyhow::Context;
use clap::Parser;
use shelly_exporter::infra::labels::parse_const_labels;
use shelly_exporter::infra::tls::load_server_config;
use shelly_exporter::infra::{BrokerListener, Config, MetricRegistry};
use shelly_exporter::io::MetricsServer;
use shelly_exporter::services::lifecycle::ListenerOutcome;
use shelly_exporter::services::{Coordinator, TopicRouter};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

/// Shelly exporter - embedded MQTT broker with a Prometheus endpoint
#[derive(Parser, Debug)]
#[command(name = "shelly-exporter", version, about)]
struct Args {
    /// Path to an optional TOML configuration file (overrides CONFIG_FILE)
    #[arg(short, long)]
    config: Option<String>,
}

/// `RUST_LOG` wins; otherwise `LOG_LEVEL` (debug|info|warn|warning|error)
fn log_filter() -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }
    let level = std::env::var("LOG_LEVEL").unwrap_or_default().to_ascii_lowercase();
    let level = match level.as_str() {
        "debug" | "info" | "warn" | "error" | "trace" => level.as_str(),
        "warning" => "warn",
        _ => "info",
    };
    EnvFilter::new(level)
}

/// Resolve on SIGINT or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "ctrl_c_handler_failed");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "sigterm_handler_failed");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown_signal_received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(log_filter())
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .init();

    let args = Args::parse();

    info!(
        version = %env!("CARGO_PKG_VERSION"),
        git_hash = %env!("GIT_HASH"),
        "shelly-exporter starting"
    );

    let config = Config::load(args.config.as_deref())?;
    info!(
        config_file = %config.config_file(),
        mqtt_host = %config.mqtt_host(),
        mqtt_port = %config.mqtt_port(),
        prometheus_host = %config.prometheus_host(),
        prometheus_port = %config.prometheus_port(),
        prometheus_path = %config.prometheus_path(),
        shutdown_timeout_secs = %config.shutdown_timeout().as_secs(),
        "config_loaded"
    );

    let registry = Arc::new(MetricRegistry::new(parse_const_labels(config.prometheus_labels())));
    if !registry.const_labels().is_empty() {
        info!(labels = ?registry.const_labels(), "const_labels_applied");
    }

    let router = Arc::new(TopicRouter::new(registry.clone()));
    let broker = BrokerListener::new(&config, router)?;

    let http_tls = match config.prometheus_tls() {
        Some(paths) => {
            Some(load_server_config(paths).context("failed to load HTTP TLS material")?)
        }
        None => None,
    };
    let server = MetricsServer::new(&config, registry, http_tls);

    // Registration order is startup order; shutdown runs in reverse
    let coordinator = Coordinator::new(config.shutdown_timeout())
        .with_listener(Arc::new(broker))
        .with_listener(Arc::new(server));

    let report = coordinator.run(shutdown_signal()).await;

    let clean = report.outcomes.iter().all(|(_, o)| *o == ListenerOutcome::Stopped);
    if !clean {
        warn!(outcomes = ?report.outcomes, "shutdown_unclean");
    }

    info!(elapsed_ms = %report.elapsed.as_millis(), "shutdown_complete");
    Ok(())
}
