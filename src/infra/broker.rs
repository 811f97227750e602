//! Embedded MQTT broker using rumqttd
//!
//! Devices publish straight to this broker. A local link subscribed to `#`
//! feeds every publish to the topic router on the async side.

use crate::infra::config::{Config as AppConfig, TlsPaths};
use crate::services::lifecycle::{shutdown_requested, Listener};
use crate::services::router::TopicRouter;
use anyhow::{bail, Context};
use async_trait::async_trait;
use rand::Rng;
use rumqttd::{
    Broker, Config, ConnectionSettings, Notification, RouterConfig, ServerSettings, TlsConfig,
};
use std::collections::HashMap;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::thread;
use tokio::sync::{oneshot, watch};
use tracing::{debug, info};

/// Universal wildcard: every topic
pub const WILDCARD_FILTER: &str = "#";

/// Client id prefix of the in-process subscriber link. A random suffix keeps
/// network clients from taking over the session by reusing the id.
const LINK_CLIENT_PREFIX: &str = "shelly-exporter-link";

fn random_link_id() -> String {
    format!("{LINK_CLIENT_PREFIX}-{:016x}", rand::rng().random::<u64>())
}

pub struct BrokerListener {
    listen: SocketAddr,
    link_id: String,
    credentials: Option<(String, String)>,
    tls: Option<TlsPaths>,
    router: Arc<TopicRouter>,
}

impl BrokerListener {
    pub fn new(app_config: &AppConfig, router: Arc<TopicRouter>) -> anyhow::Result<Self> {
        let addr = format!("{}:{}", app_config.mqtt_host(), app_config.mqtt_port());
        let listen = addr
            .to_socket_addrs()
            .with_context(|| format!("invalid MQTT bind address {addr}"))?
            .next()
            .with_context(|| format!("MQTT bind address {addr} did not resolve"))?;

        if app_config.mqtt_credentials().is_some() {
            info!("mqtt_auth_enabled");
        }
        if app_config.mqtt_tls().is_some() {
            info!("mqtt_tls_enabled");
        }

        Ok(Self {
            listen,
            link_id: random_link_id(),
            credentials: app_config
                .mqtt_credentials()
                .map(|(user, pass)| (user.to_string(), pass.to_string())),
            tls: app_config.mqtt_tls().cloned(),
            router,
        })
    }

    pub fn listen_addr(&self) -> SocketAddr {
        self.listen
    }

    pub fn link_id(&self) -> &str {
        &self.link_id
    }

    /// Build the rumqttd configuration: one v4 TCP listener, optionally TLS,
    /// with a single username/password allow rule or no auth at all.
    fn broker_config(&self) -> Config {
        let router_config = RouterConfig {
            max_segment_size: 104857600,
            max_segment_count: 10,
            max_connections: 10010,
            max_outgoing_packet_count: 200,
            initialized_filters: None,
            ..Default::default()
        };

        let auth = self
            .credentials
            .as_ref()
            .map(|(user, pass)| HashMap::from([(user.clone(), pass.clone())]));

        let tls = self.tls.as_ref().map(|paths| TlsConfig::Rustls {
            capath: None,
            certpath: paths.cert.display().to_string(),
            keypath: paths.key.display().to_string(),
        });

        let name = if tls.is_some() {
            format!("mqtt-tls-{}", self.listen.port())
        } else {
            format!("mqtt-{}", self.listen.port())
        };

        let mut servers = HashMap::new();
        servers.insert(
            name.clone(),
            ServerSettings {
                name,
                listen: self.listen,
                tls,
                next_connection_delay_ms: 1,
                connections: ConnectionSettings {
                    connection_timeout_ms: 5000,
                    max_payload_size: 262144,
                    max_inflight_count: 200,
                    auth,
                    dynamic_filters: false,
                    external_auth: None,
                },
            },
        );

        Config {
            id: 0,
            router: router_config,
            v4: Some(servers),
            v5: None,
            ws: None,
            prometheus: None,
            metrics: None,
            bridge: None,
            console: None,
            cluster: None,
        }
    }
}

#[async_trait]
impl Listener for BrokerListener {
    fn name(&self) -> &'static str {
        "mqtt"
    }

    async fn serve(&self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        // Fail fast on an occupied port; rumqttd binds later on its own thread
        std::net::TcpListener::bind(self.listen)
            .with_context(|| format!("failed to bind MQTT broker on {}", self.listen))?;

        let mut broker = Broker::new(self.broker_config());
        let (mut link_tx, mut link_rx) =
            broker.link(&self.link_id).context("failed to create broker link")?;
        link_tx.subscribe(WILDCARD_FILTER).context("failed to subscribe broker link")?;

        // start() blocks for the broker's lifetime and only returns on failure
        let (failed_tx, mut failed_rx) = oneshot::channel::<String>();
        thread::Builder::new()
            .name("mqtt-broker".to_string())
            .spawn(move || {
                if let Err(e) = broker.start() {
                    let _ = failed_tx.send(e.to_string());
                }
            })
            .context("failed to spawn broker thread")?;

        info!(listen = %self.listen, "mqtt_broker_started");

        loop {
            tokio::select! {
                _ = shutdown_requested(&mut shutdown) => {
                    info!("mqtt_broker_shutdown");
                    return Ok(());
                }
                failure = &mut failed_rx => {
                    match failure {
                        Ok(reason) => bail!("broker stopped: {reason}"),
                        Err(_) => bail!("broker thread exited"),
                    }
                }
                notification = link_rx.next() => {
                    match notification.context("broker link closed")? {
                        Some(Notification::Forward(forward)) => {
                            let publish = forward.publish;
                            match std::str::from_utf8(&publish.topic) {
                                Ok(topic) => self.router.route(topic, &publish.payload),
                                Err(e) => debug!(error = %e, "mqtt_topic_not_utf8"),
                            }
                        }
                        // Router paused this link; ask to be rescheduled
                        Some(Notification::Unschedule) => {
                            link_rx.wake().await.context("failed to wake broker link")?;
                        }
                        Some(_) | None => {}
                    }
                }
            }
        }
    }
}
