//! Configuration loading
//!
//! Sources, highest precedence first:
//! 1. Environment variables (`MQTT_HOST`, `PROM_PORT`, ...)
//! 2. TOML file selected by `--config <path>` or `CONFIG_FILE`
//! 3. Built-in defaults
//!
//! The metrics password is hashed while loading; `Config` only ever holds
//! its SHA-256 digest.

use crate::infra::auth::{sha256, Sha256Digest};
use anyhow::Context;
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

const DEFAULT_MQTT_HOST: &str = "0.0.0.0";
const DEFAULT_MQTT_PORT: u16 = 1883;
const DEFAULT_PROM_HOST: &str = "0.0.0.0";
const DEFAULT_PROM_PORT: u16 = 2112;
const DEFAULT_PROM_PATH: &str = "/metrics";
const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 5;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}: expected {expected}")]
    InvalidValue { key: &'static str, value: String, expected: &'static str },
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MqttSection {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PrometheusSection {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub path: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Constant labels, `key=value,key=value`
    pub labels: Option<String>,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ShutdownSection {
    pub timeout_secs: Option<u64>,
}

/// On-disk configuration; every field optional
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TomlConfig {
    pub mqtt: MqttSection,
    pub prometheus: PrometheusSection,
    pub shutdown: ShutdownSection,
}

/// Certificate chain and private key, both PEM
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsPaths {
    pub cert: PathBuf,
    pub key: PathBuf,
}

impl TlsPaths {
    /// TLS is on only when both halves are configured
    fn from_pair(cert: Option<PathBuf>, key: Option<PathBuf>) -> Option<Self> {
        match (cert, key) {
            (Some(cert), Some(key)) => Some(Self { cert, key }),
            _ => None,
        }
    }
}

/// Validated configuration, immutable after load
#[derive(Clone)]
pub struct Config {
    mqtt_host: String,
    mqtt_port: u16,
    mqtt_credentials: Option<(String, String)>,
    mqtt_tls: Option<TlsPaths>,
    prometheus_host: String,
    prometheus_port: u16,
    prometheus_path: String,
    prometheus_username: Option<String>,
    prometheus_password_sha: Option<Sha256Digest>,
    prometheus_labels: String,
    prometheus_tls: Option<TlsPaths>,
    shutdown_timeout: Duration,
    config_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mqtt_host: DEFAULT_MQTT_HOST.to_string(),
            mqtt_port: DEFAULT_MQTT_PORT,
            mqtt_credentials: None,
            mqtt_tls: None,
            prometheus_host: DEFAULT_PROM_HOST.to_string(),
            prometheus_port: DEFAULT_PROM_PORT,
            prometheus_path: DEFAULT_PROM_PATH.to_string(),
            prometheus_username: None,
            prometheus_password_sha: None,
            prometheus_labels: String::new(),
            prometheus_tls: None,
            shutdown_timeout: Duration::from_secs(DEFAULT_SHUTDOWN_TIMEOUT_SECS),
            config_file: "default".to_string(),
        }
    }
}

/// Empty strings count as unset
fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

fn parse_number<T: std::str::FromStr>(
    key: &'static str,
    value: String,
    expected: &'static str,
) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue { key, value, expected })
}

/// Ensure the metrics path starts with `/`
pub fn normalize_metrics_path(path: &str) -> String {
    let path = path.trim();
    if path.is_empty() {
        DEFAULT_PROM_PATH.to_string()
    } else if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    }
}

impl Config {
    /// Config file from the command line, else `CONFIG_FILE`
    pub fn resolve_config_path(cli_path: Option<&str>) -> Option<String> {
        cli_path.map(str::to_string).or_else(|| non_empty(env::var("CONFIG_FILE").ok()))
    }

    /// Read and parse a TOML config file
    pub fn read_file<P: AsRef<Path>>(path: P) -> anyhow::Result<TomlConfig> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    /// Merge a parsed file with an environment lookup
    ///
    /// `env` is injected so tests never touch the process environment.
    pub fn from_sources<E>(file: TomlConfig, env: E) -> Result<Self, ConfigError>
    where
        E: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| non_empty(env(key));
        let defaults = Self::default();
        let TomlConfig { mqtt, prometheus, shutdown } = file;

        let mqtt_port = match var("MQTT_PORT") {
            Some(v) => parse_number("MQTT_PORT", v, "a port number")?,
            None => mqtt.port.unwrap_or(defaults.mqtt_port),
        };
        let prometheus_port = match var("PROM_PORT") {
            Some(v) => parse_number("PROM_PORT", v, "a port number")?,
            None => prometheus.port.unwrap_or(defaults.prometheus_port),
        };
        let shutdown_timeout_secs: u64 = match var("SHUTDOWN_TIMEOUT_SECS") {
            Some(v) => parse_number("SHUTDOWN_TIMEOUT_SECS", v, "whole seconds")?,
            None => shutdown.timeout_secs.unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT_SECS),
        };

        let mqtt_username = var("MQTT_USER").or(non_empty(mqtt.username));
        let mqtt_password = var("MQTT_PASS").or(non_empty(mqtt.password));
        let mqtt_credentials = match (mqtt_username, mqtt_password) {
            (Some(user), Some(pass)) => Some((user, pass)),
            _ => None,
        };

        let prometheus_password_sha = var("PROM_PASS")
            .or(non_empty(prometheus.password))
            .map(|plaintext| sha256(&plaintext));

        let path = var("PROM_PATH").or(prometheus.path).unwrap_or(defaults.prometheus_path);

        Ok(Self {
            mqtt_host: var("MQTT_HOST").or(non_empty(mqtt.host)).unwrap_or(defaults.mqtt_host),
            mqtt_port,
            mqtt_credentials,
            mqtt_tls: TlsPaths::from_pair(
                var("MQTT_TLS_CERT").map(PathBuf::from).or(mqtt.tls_cert),
                var("MQTT_TLS_KEY").map(PathBuf::from).or(mqtt.tls_key),
            ),
            prometheus_host: var("PROM_HOST")
                .or(non_empty(prometheus.host))
                .unwrap_or(defaults.prometheus_host),
            prometheus_port,
            prometheus_path: normalize_metrics_path(&path),
            prometheus_username: var("PROM_USER").or(non_empty(prometheus.username)),
            prometheus_password_sha,
            prometheus_labels: var("PROM_LABELS").or(prometheus.labels).unwrap_or_default(),
            prometheus_tls: TlsPaths::from_pair(
                var("HTTP_TLS_CERT").map(PathBuf::from).or(prometheus.tls_cert),
                var("HTTP_TLS_KEY").map(PathBuf::from).or(prometheus.tls_key),
            ),
            shutdown_timeout: Duration::from_secs(shutdown_timeout_secs),
            config_file: defaults.config_file,
        })
    }

    /// Load configuration from the optional file and the process environment
    pub fn load(cli_path: Option<&str>) -> anyhow::Result<Self> {
        let path = Self::resolve_config_path(cli_path);
        let file = match &path {
            Some(path) => Self::read_file(path)?,
            None => TomlConfig::default(),
        };
        let mut config = Self::from_sources(file, |key| env::var(key).ok())?;
        if let Some(path) = path {
            config.config_file = path;
        }
        Ok(config)
    }

    pub fn mqtt_host(&self) -> &str {
        &self.mqtt_host
    }

    pub fn mqtt_port(&self) -> u16 {
        self.mqtt_port
    }

    /// Username and password, only when both are set
    pub fn mqtt_credentials(&self) -> Option<(&str, &str)> {
        self.mqtt_credentials.as_ref().map(|(u, p)| (u.as_str(), p.as_str()))
    }

    pub fn mqtt_tls(&self) -> Option<&TlsPaths> {
        self.mqtt_tls.as_ref()
    }

    pub fn prometheus_host(&self) -> &str {
        &self.prometheus_host
    }

    pub fn prometheus_port(&self) -> u16 {
        self.prometheus_port
    }

    pub fn prometheus_path(&self) -> &str {
        &self.prometheus_path
    }

    pub fn prometheus_username(&self) -> Option<&str> {
        self.prometheus_username.as_deref()
    }

    pub fn prometheus_password_sha(&self) -> Option<&Sha256Digest> {
        self.prometheus_password_sha.as_ref()
    }

    /// Basic auth is enforced only when both username and password are set
    pub fn prometheus_auth(&self) -> Option<(&str, &Sha256Digest)> {
        self.prometheus_username().zip(self.prometheus_password_sha())
    }

    pub fn prometheus_labels(&self) -> &str {
        &self.prometheus_labels
    }

    pub fn prometheus_tls(&self) -> Option<&TlsPaths> {
        self.prometheus_tls.as_ref()
    }

    pub fn shutdown_timeout(&self) -> Duration {
        self.shutdown_timeout
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("mqtt_host", &self.mqtt_host)
            .field("mqtt_port", &self.mqtt_port)
            .field("mqtt_auth", &self.mqtt_credentials.is_some())
            .field("mqtt_tls", &self.mqtt_tls)
            .field("prometheus_host", &self.prometheus_host)
            .field("prometheus_port", &self.prometheus_port)
            .field("prometheus_path", &self.prometheus_path)
            .field("prometheus_auth", &self.prometheus_auth().is_some())
            .field("prometheus_labels", &self.prometheus_labels)
            .field("prometheus_tls", &self.prometheus_tls)
            .field("shutdown_timeout", &self.shutdown_timeout)
            .field("config_file", &self.config_file)
            .finish()
    }
}
