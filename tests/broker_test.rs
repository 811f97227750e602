//! End-to-end: device publish through the embedded broker into the registry

use rumqttc::{AsyncClient, MqttOptions, QoS};
use shelly_exporter::infra::{BrokerListener, Config, Gauge, MetricRegistry};
use shelly_exporter::services::{Listener, TopicRouter};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port()
}

fn broker_on(port: u16) -> (BrokerListener, Arc<MetricRegistry>) {
    let vars: HashMap<String, String> = [
        ("MQTT_HOST".to_string(), "127.0.0.1".to_string()),
        ("MQTT_PORT".to_string(), port.to_string()),
    ]
    .into();
    let config = Config::from_sources(Default::default(), |key| vars.get(key).cloned()).unwrap();

    let registry = Arc::new(MetricRegistry::default());
    let router = Arc::new(TopicRouter::new(registry.clone()));
    (BrokerListener::new(&config, router).unwrap(), registry)
}

async fn start(
    broker: BrokerListener,
    port: u16,
) -> (watch::Sender<bool>, JoinHandle<anyhow::Result<()>>) {
    let (stop_tx, stop_rx) = watch::channel(false);
    let handle = tokio::spawn(async move { broker.serve(stop_rx).await });

    for _ in 0..200 {
        if tokio::net::TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    (stop_tx, handle)
}

fn client(id: &str, port: u16) -> AsyncClient {
    let mut options = MqttOptions::new(id, "127.0.0.1", port);
    options.set_keep_alive(Duration::from_secs(5));
    let (client, mut eventloop) = AsyncClient::new(options, 10);
    tokio::spawn(async move {
        loop {
            if eventloop.poll().await.is_err() {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
    });
    client
}

async fn wait_for_value(registry: &MetricRegistry, gauge: Gauge, labels: &[&str]) -> Option<f64> {
    for _ in 0..200 {
        if let Some(value) = registry.get(gauge, labels) {
            return Some(value);
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    None
}

#[tokio::test]
async fn test_publish_reaches_registry() {
    let port = free_port();
    let (broker, registry) = broker_on(port);
    let (stop_tx, handle) = start(broker, port).await;
    let client = client("shellyplug-test", port);

    client
        .publish(
            "shellyplug-1/status/switch:0",
            QoS::AtLeastOnce,
            false,
            r#"{"id":0,"output":true,"apower":12.5,"voltage":231.2,"temperature":{"tC":41.0}}"#,
        )
        .await
        .unwrap();
    client
        .publish("shellyplug-1/status/sys", QoS::AtLeastOnce, false, r#"{"output":true}"#)
        .await
        .unwrap();

    let labels = ["shellyplug-1", "0"];
    assert_eq!(wait_for_value(&registry, Gauge::ActivePower, &labels).await, Some(12.5));
    assert_eq!(registry.get(Gauge::Output, &labels), Some(1.0));
    assert_eq!(registry.get(Gauge::Voltage, &labels), Some(231.2));
    assert_eq!(registry.get(Gauge::Temperature, &labels), Some(41.0));
    assert_eq!(registry.series_count(Gauge::Output), 1);

    stop_tx.send(true).unwrap();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_client_reusing_exporter_name_does_not_stop_ingestion() {
    let port = free_port();
    let (broker, registry) = broker_on(port);
    let (stop_tx, handle) = start(broker, port).await;

    // The binary's own name is the obvious guess for the internal session id
    let client = client("shelly-exporter", port);
    client
        .publish("p/status/switch:0", QoS::AtLeastOnce, false, r#"{"voltage":230}"#)
        .await
        .unwrap();

    assert_eq!(wait_for_value(&registry, Gauge::Voltage, &["p", "0"]).await, Some(230.0));
    assert!(!handle.is_finished());

    stop_tx.send(true).unwrap();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_bind_conflict_fails() {
    let port = free_port();
    let _occupied = std::net::TcpListener::bind(("127.0.0.1", port)).unwrap();
    let (broker, _registry) = broker_on(port);

    let (_stop_tx, stop_rx) = watch::channel(false);
    let result = tokio::time::timeout(Duration::from_secs(5), broker.serve(stop_rx))
        .await
        .expect("serve should return on bind failure");

    let err = result.unwrap_err();
    assert!(format!("{err:#}").contains("failed to bind MQTT broker"));
}
