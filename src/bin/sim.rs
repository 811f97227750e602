//! Shelly device simulator
//!
//! Publishes synthetic `<device>/status/switch:<n>` reports to a broker so
//! the exporter can be exercised without real hardware. Each simulated plug
//! keeps a base load, accumulates energy, and occasionally flips its relay.
//!
//! Usage:
//!   cargo run --bin shelly-sim -- --devices 3 --interval-ms 2000

use clap::Parser;
use rand::Rng;
use rumqttc::{AsyncClient, Event as MqttEvent, MqttOptions, Packet, QoS};
use serde_json::{json, Value};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

/// Shelly plug simulator
#[derive(Parser, Debug)]
#[command(name = "shelly-sim", version, about)]
struct Args {
    /// Broker host
    #[arg(long, default_value = "localhost")]
    mqtt_host: String,

    /// Broker port
    #[arg(long, default_value = "1883")]
    mqtt_port: u16,

    /// Broker username
    #[arg(long, env = "MQTT_USER")]
    mqtt_user: Option<String>,

    /// Broker password
    #[arg(long, env = "MQTT_PASS")]
    mqtt_pass: Option<String>,

    /// Number of simulated plugs
    #[arg(long, default_value = "2")]
    devices: usize,

    /// Switch channels per plug
    #[arg(long, default_value = "1")]
    channels: u32,

    /// Publish interval per plug in milliseconds
    #[arg(long, default_value = "5000")]
    interval_ms: u64,

    /// Device id prefix
    #[arg(long, default_value = "shellyplugsg3-sim")]
    prefix: String,
}

/// One simulated switch channel
struct SimChannel {
    device: String,
    index: u32,
    output: bool,
    base_load_w: f64,
    energy_wh: f64,
    returned_wh: f64,
    minute_wh: [f64; 3],
}

impl SimChannel {
    fn new(device: String, index: u32, rng: &mut impl Rng) -> Self {
        Self {
            device,
            index,
            output: true,
            base_load_w: rng.random_range(5.0..1800.0),
            energy_wh: rng.random_range(0.0..50_000.0),
            returned_wh: 0.0,
            minute_wh: [0.0; 3],
        }
    }

    fn topic(&self) -> String {
        format!("{}/status/switch:{}", self.device, self.index)
    }

    /// Advance by one interval and render the status report
    fn tick(&mut self, interval: Duration, rng: &mut impl Rng) -> Value {
        if rng.random_bool(0.05) {
            self.output = !self.output;
        }

        let voltage = rng.random_range(225.0..240.0);
        let freq = rng.random_range(49.9..50.1);
        let (apower, pf) = if self.output {
            (self.base_load_w * rng.random_range(0.9..1.1), rng.random_range(0.85..1.0))
        } else {
            (0.0, 0.0)
        };
        let current = if voltage > 0.0 { apower / voltage } else { 0.0 };

        let step_wh = apower * interval.as_secs_f64() / 3600.0;
        self.energy_wh += step_wh;
        self.minute_wh = [step_wh * 1000.0, self.minute_wh[0], self.minute_wh[1]];
        // Occasional export, as on a plug behind a small inverter
        if rng.random_bool(0.02) {
            self.returned_wh += rng.random_range(0.0..2.0);
        }

        let temp_c: f64 = 30.0 + apower / 100.0 + rng.random_range(-0.5..0.5);
        let minute_ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| (d.as_secs() / 60 * 60) as i64)
            .unwrap_or_default();

        json!({
            "id": self.index,
            "source": "timer",
            "output": self.output,
            "apower": round(apower, 1),
            "voltage": round(voltage, 1),
            "freq": round(freq, 2),
            "current": round(current, 3),
            "pf": round(pf, 2),
            "aenergy": {
                "total": round(self.energy_wh, 3),
                "by_minute": self.minute_wh.map(|v| round(v, 3)),
                "minute_ts": minute_ts,
            },
            "ret_aenergy": {
                "total": round(self.returned_wh, 3),
                "by_minute": [0.0, 0.0, 0.0],
                "minute_ts": minute_ts,
            },
            "temperature": {
                "tC": round(temp_c, 1),
                "tF": round(temp_c * 9.0 / 5.0 + 32.0, 1),
            },
        })
    }
}

fn round(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .init();

    let args = Args::parse();
    let interval = Duration::from_millis(args.interval_ms.max(100));

    let mut mqtt_options = MqttOptions::new(
        format!("{}-{}", args.prefix, std::process::id()),
        &args.mqtt_host,
        args.mqtt_port,
    );
    mqtt_options.set_keep_alive(Duration::from_secs(30));
    if let (Some(user), Some(pass)) = (&args.mqtt_user, &args.mqtt_pass) {
        mqtt_options.set_credentials(user, pass);
    }

    let (client, mut eventloop) = AsyncClient::new(mqtt_options, 100);

    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(MqttEvent::Incoming(Packet::ConnAck(_))) => info!("sim_mqtt_connected"),
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "sim_mqtt_error");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    });

    let mut channels: Vec<SimChannel> = {
        let mut rng = rand::rng();
        (0..args.devices)
            .flat_map(|d| (0..args.channels).map(move |i| (d, i)))
            .map(|(d, i)| SimChannel::new(format!("{}-{:02}", args.prefix, d + 1), i, &mut rng))
            .collect()
    };

    info!(
        host = %args.mqtt_host,
        port = %args.mqtt_port,
        channels = %channels.len(),
        interval_ms = %interval.as_millis(),
        "sim_started"
    );

    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = ticker.tick() => {
                let reports: Vec<(String, Vec<u8>)> = {
                    let mut rng = rand::rng();
                    channels
                        .iter_mut()
                        .map(|ch| {
                            let payload = ch.tick(interval, &mut rng).to_string().into_bytes();
                            (ch.topic(), payload)
                        })
                        .collect()
                };
                for (topic, payload) in reports {
                    match client.publish(&topic, QoS::AtMostOnce, false, payload).await {
                        Ok(()) => debug!(topic = %topic, "sim_published"),
                        Err(e) => warn!(topic = %topic, error = %e, "sim_publish_failed"),
                    }
                }
            }
        }
    }

    let _ = client.disconnect().await;
    info!("sim_stopped");
    Ok(())
}
