//! Prometheus text exposition (format 0.0.4)
//!
//! Renders registry snapshots. Families without any series still emit their
//! HELP/TYPE header.

use crate::infra::metrics::FamilySnapshot;
use std::fmt::Write;

pub const CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Escape a label value: backslash, double quote, newline
fn escape_label_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            c => out.push(c),
        }
    }
    out
}

/// Escape HELP text: backslash, newline
fn escape_help(help: &str) -> String {
    help.replace('\\', "\\\\").replace('\n', "\\n")
}

fn format_value(value: f64) -> String {
    if value.is_nan() {
        "NaN".to_string()
    } else if value.is_infinite() {
        if value > 0.0 { "+Inf" } else { "-Inf" }.to_string()
    } else {
        value.to_string()
    }
}

/// Write one gauge family with all its series
fn write_gauge_family(output: &mut String, family: &FamilySnapshot) {
    let name = family.name;
    let _ = writeln!(output, "# HELP {name} {}", escape_help(family.help));
    let _ = writeln!(output, "# TYPE {name} gauge");

    for series in &family.series {
        output.push_str(name);
        if !series.labels.is_empty() {
            output.push('{');
            for (i, (key, value)) in series.labels.iter().enumerate() {
                if i > 0 {
                    output.push(',');
                }
                let _ = write!(output, "{key}=\"{}\"", escape_label_value(value));
            }
            output.push('}');
        }
        let _ = writeln!(output, " {}", format_value(series.value));
    }
}

/// Render all families in text exposition format
pub fn encode_text(families: &[FamilySnapshot]) -> String {
    let mut output = String::with_capacity(4096);
    for family in families {
        write_gauge_family(&mut output, family);
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::telemetry::TelemetrySample;
    use crate::infra::labels::parse_const_labels;
    use crate::infra::metrics::{MetricRegistry, SeriesSnapshot};

    #[test]
    fn test_encode_registry() {
        let registry = MetricRegistry::new(parse_const_labels("site=home"));
        let sample = TelemetrySample {
            output: true,
            voltage: Some(230.0),
            current: Some(0.5),
            ..Default::default()
        };
        registry.update(&sample, &["shellyplug-1", "0"]).unwrap();

        let output = encode_text(&registry.gather());

        assert!(output.contains("# HELP shelly_output Switch output state\n"));
        assert!(output.contains("# TYPE shelly_output gauge\n"));
        let labels = r#"{site="home",device="shellyplug-1",index="0"}"#;
        assert!(output.contains(&format!("shelly_output{labels} 1\n")));
        assert!(output.contains(&format!("shelly_voltage{labels} 230\n")));
        assert!(output.contains(&format!("shelly_current{labels} 0.5\n")));
        // Declared but never written
        assert!(output.contains("# TYPE shelly_temperature_celsius gauge\n"));
        assert!(!output.contains("shelly_temperature_celsius{"));
    }

    #[test]
    fn test_label_values_escaped() {
        let family = FamilySnapshot {
            name: "shelly_voltage",
            help: "Voltage in Volts",
            series: vec![SeriesSnapshot {
                labels: vec![("device".to_string(), "a\"b\\c\nd".to_string())],
                value: 1.0,
            }],
        };
        let output = encode_text(&[family]);
        assert!(output.contains(r#"shelly_voltage{device="a\"b\\c\nd"} 1"#));
    }

    #[test]
    fn test_special_values() {
        assert_eq!(format_value(f64::NAN), "NaN");
        assert_eq!(format_value(f64::INFINITY), "+Inf");
        assert_eq!(format_value(f64::NEG_INFINITY), "-Inf");
        assert_eq!(format_value(-0.25), "-0.25");
        assert_eq!(format_value(12.3), "12.3");
    }

    #[test]
    fn test_series_without_labels() {
        let family = FamilySnapshot {
            name: "shelly_freq",
            help: "Frequency in Hz",
            series: vec![SeriesSnapshot { labels: vec![], value: 50.0 }],
        };
        assert!(encode_text(&[family]).ends_with("shelly_freq 50\n"));
    }
}
