//! Operator-supplied constant labels
//!
//! Parsed from a flat `key=value,key=value` string (e.g. `PROM_LABELS`).
//! Malformed pairs are skipped with a warning, never fatal.

use std::collections::BTreeMap;
use tracing::warn;

/// Label keys carried by every sample, in order
pub const SAMPLE_LABEL_KEYS: [&str; 2] = ["device", "index"];

/// Prometheus label name rule: `[a-zA-Z_][a-zA-Z0-9_]*`
pub fn is_valid_label_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Parse constant labels from `key=value` pairs separated by commas
///
/// Keys and values are trimmed. A pair is skipped when it has no `=`, an empty
/// key or value, an invalid label name, or a key reserved for sample labels.
/// A repeated key keeps its last value.
pub fn parse_const_labels(raw: &str) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();

    for pair in raw.split(',') {
        if pair.trim().is_empty() {
            continue;
        }
        let Some((key, value)) = pair.split_once('=') else {
            warn!(pair = %pair, "const_label_missing_separator");
            continue;
        };
        let (key, value) = (key.trim(), value.trim());
        if key.is_empty() || value.is_empty() {
            warn!(pair = %pair, "const_label_empty_key_or_value");
            continue;
        }
        if !is_valid_label_name(key) {
            warn!(key = %key, "const_label_invalid_name");
            continue;
        }
        if SAMPLE_LABEL_KEYS.contains(&key) {
            warn!(key = %key, "const_label_reserved_name");
            continue;
        }
        labels.insert(key.to_string(), value.to_string());
    }

    labels
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_drops_malformed_and_trims() {
        let labels = parse_const_labels("env=prod, zone =east,bad,  =x");
        assert_eq!(labels.len(), 2);
        assert_eq!(labels.get("env").map(String::as_str), Some("prod"));
        assert_eq!(labels.get("zone").map(String::as_str), Some("east"));
    }

    #[test]
    fn test_parse_empty_string() {
        assert!(parse_const_labels("").is_empty());
        assert!(parse_const_labels(" , ,").is_empty());
    }

    #[test]
    fn test_parse_empty_value_and_extra_equals() {
        let labels = parse_const_labels("a=,b=c=d");
        assert_eq!(labels.len(), 1);
        assert_eq!(labels.get("b").map(String::as_str), Some("c=d"));
    }

    #[test]
    fn test_parse_rejects_invalid_and_reserved_names() {
        let labels = parse_const_labels("1st=x,my-label=y,device=z,index=0,site=home");
        assert_eq!(labels.len(), 1);
        assert_eq!(labels.get("site").map(String::as_str), Some("home"));
    }

    #[test]
    fn test_last_value_wins() {
        let labels = parse_const_labels("env=dev,env=prod");
        assert_eq!(labels.get("env").map(String::as_str), Some("prod"));
    }

    #[test]
    fn test_is_valid_label_name() {
        assert!(is_valid_label_name("env"));
        assert!(is_valid_label_name("_private"));
        assert!(is_valid_label_name("zone_2"));
        assert!(!is_valid_label_name(""));
        assert!(!is_valid_label_name("2zone"));
        assert!(!is_valid_label_name("zone.name"));
    }
}
