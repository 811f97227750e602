//! Topic router - maps inbound MQTT publishes onto the metric registry
//!
//! Only `<device>/status/switch:<index>` is interpreted; every other topic
//! is dropped without decoding. A bad message is logged and swallowed so it
//! can never interrupt the broker's dispatch loop.

use crate::domain::telemetry::TelemetrySample;
use crate::infra::metrics::MetricRegistry;
use std::sync::Arc;
use tracing::{error, trace};

/// Broker-internal topics start with this marker
pub const SYSTEM_TOPIC_PREFIX: &str = "$SYS";

const SWITCH_STATUS_SEGMENT: &str = "status/switch:";

/// Label values extracted from a switch status topic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwitchTopic<'a> {
    pub device: &'a str,
    pub index: &'a str,
}

/// Match `^([^/]+)/status/switch:(\d+)$`
pub fn parse_switch_topic(topic: &str) -> Option<SwitchTopic<'_>> {
    let (device, rest) = topic.split_once('/')?;
    if device.is_empty() {
        return None;
    }
    let index = rest.strip_prefix(SWITCH_STATUS_SEGMENT)?;
    if index.is_empty() || !index.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some(SwitchTopic { device, index })
}

pub struct TopicRouter {
    registry: Arc<MetricRegistry>,
}

impl TopicRouter {
    pub fn new(registry: Arc<MetricRegistry>) -> Self {
        Self { registry }
    }

    /// Route one published message. Never fails.
    pub fn route(&self, topic: &str, payload: &[u8]) {
        if topic.starts_with(SYSTEM_TOPIC_PREFIX) {
            return;
        }
        let Some(SwitchTopic { device, index }) = parse_switch_topic(topic) else {
            trace!(topic = %topic, "topic_ignored");
            return;
        };

        let sample = TelemetrySample::decode(payload);
        if let Err(e) = self.registry.update(&sample, &[device, index]) {
            error!(device = %device, index = %index, error = %e, "metrics_update_failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::metrics::Gauge;

    fn router() -> (TopicRouter, Arc<MetricRegistry>) {
        let registry = Arc::new(MetricRegistry::default());
        (TopicRouter::new(registry.clone()), registry)
    }

    fn total_series(registry: &MetricRegistry) -> usize {
        Gauge::ALL.iter().map(|&g| registry.series_count(g)).sum()
    }

    #[test]
    fn test_parse_switch_topic() {
        assert_eq!(
            parse_switch_topic("shellyplug-1/status/switch:0"),
            Some(SwitchTopic { device: "shellyplug-1", index: "0" })
        );
        assert_eq!(
            parse_switch_topic("shellypro4pm-abc/status/switch:12"),
            Some(SwitchTopic { device: "shellypro4pm-abc", index: "12" })
        );
        // Device may contain anything but '/'
        assert_eq!(
            parse_switch_topic("plug:with$chars/status/switch:3"),
            Some(SwitchTopic { device: "plug:with$chars", index: "3" })
        );
    }

    #[test]
    fn test_parse_rejects_other_shapes() {
        for topic in [
            "",
            "/status/switch:0",
            "shellyplug-1/status/switch:",
            "shellyplug-1/status/switch:a",
            "shellyplug-1/status/switch:0x",
            "shellyplug-1/status/switch:-1",
            "shellyplug-1/status/switch:0/extra",
            "home/shellyplug-1/status/switch:0",
            "shellyplug-1/status/input:0",
            "shellyplug-1/events/rpc",
            "shellyplug-1/online",
            "shellyplug-1/status/switch:٣",
        ] {
            assert_eq!(parse_switch_topic(topic), None, "topic {topic:?} should not match");
        }
    }

    #[test]
    fn test_route_updates_registry() {
        let (router, registry) = router();
        router.route("shellyplug-1/status/switch:0", br#"{"output": true, "voltage": 230.0}"#);

        assert_eq!(registry.get(Gauge::Output, &["shellyplug-1", "0"]), Some(1.0));
        assert_eq!(registry.get(Gauge::Voltage, &["shellyplug-1", "0"]), Some(230.0));
    }

    #[test]
    fn test_route_ignores_system_topics() {
        let (router, registry) = router();
        router.route("$SYS/broker/uptime", b"12");
        router.route("$SYSplug/status/switch:0", br#"{"output": true}"#);
        assert_eq!(total_series(&registry), 0);
    }

    #[test]
    fn test_route_ignores_unmatched_topics() {
        let (router, registry) = router();
        router.route("shellyplug-1/status/sys", br#"{"output": true}"#);
        router.route("shellyplug-1/online", b"true");
        assert_eq!(total_series(&registry), 0);
    }

    #[test]
    fn test_route_partial_update_keeps_previous_values() {
        let (router, registry) = router();
        router.route("shellyplug-1/status/switch:0", br#"{"output": true, "voltage": 230}"#);
        router.route("shellyplug-1/status/switch:0", br#"{"output": true, "current": 0.5}"#);

        assert_eq!(registry.get(Gauge::Voltage, &["shellyplug-1", "0"]), Some(230.0));
        assert_eq!(registry.get(Gauge::Current, &["shellyplug-1", "0"]), Some(0.5));
    }

    #[test]
    fn test_route_garbage_payload_writes_output_only() {
        let (router, registry) = router();
        router.route("shellyplug-1/status/switch:1", b"\xff\xfe garbage");

        assert_eq!(registry.get(Gauge::Output, &["shellyplug-1", "1"]), Some(0.0));
        assert_eq!(total_series(&registry), 1);
    }
}
