//! Shelly switch status telemetry
//!
//! Payloads published on `<device>/status/switch:<n>`. Example:
//!
//! ```json
//! {
//!     "id": 0, "source": "WS_in", "output": false,
//!     "apower": 0.0, "voltage": 241.4, "freq": 50.0, "current": 0.000,
//!     "aenergy": { "total": 161.961, "by_minute": [0.0, 0.0, 0.0], "minute_ts": 1744214220 },
//!     "ret_aenergy": { "total": 0.0, "by_minute": [0.0, 0.0, 0.0], "minute_ts": 1744214220 },
//!     "temperature": { "tC": 31.5, "tF": 88.8 }
//! }
//! ```
//!
//! Decoding is best-effort. A field that is missing, `null`, or of an unexpected
//! JSON shape decodes as `None` rather than rejecting the whole sample.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use tracing::debug;

/// Decode a field, turning a shape mismatch into `None`
fn lenient<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(serde_json::from_value(value).ok())
}

/// Decode a nested struct field; only a JSON object counts as present
///
/// serde's derived visitors also accept arrays (filling fields by position),
/// which is never a valid Shelly payload.
fn lenient_object<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    match serde_json::Value::deserialize(deserializer)? {
        value @ serde_json::Value::Object(_) => Ok(serde_json::from_value(value).ok()),
        _ => Ok(None),
    }
}

/// Decode a field, turning a shape mismatch into `T::default()`
fn lenient_or_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned + Default,
{
    Ok(lenient(deserializer)?.unwrap_or_default())
}

/// Energy counter (`aenergy` / `ret_aenergy`)
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct EnergyCounter {
    /// Total energy in Wh
    #[serde(default, deserialize_with = "lenient")]
    pub total: Option<f64>,
    /// mWh for the last three complete minutes, newest first.
    /// Element 0 is the minute preceding `minute_ts`.
    #[serde(default, deserialize_with = "lenient_or_default")]
    pub by_minute: Vec<f64>,
    /// Unix timestamp (UTC) of the start of the current minute
    #[serde(default, deserialize_with = "lenient")]
    pub minute_ts: Option<i64>,
}

impl EnergyCounter {
    /// Energy accumulated during the most recent complete minute
    pub fn last_minute(&self) -> Option<f64> {
        self.by_minute.first().copied()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Temperature {
    #[serde(rename = "tC", default, deserialize_with = "lenient")]
    pub celsius: Option<f64>,
    #[serde(rename = "tF", default, deserialize_with = "lenient")]
    pub fahrenheit: Option<f64>,
}

/// One decoded switch status message
///
/// Transient: built per inbound message and dropped once folded into the registry.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct TelemetrySample {
    /// Switch component instance id
    #[serde(default, deserialize_with = "lenient")]
    pub id: Option<u32>,
    /// Source of the last command (init, WS_in, http, ...)
    #[serde(default, deserialize_with = "lenient")]
    pub source: Option<String>,
    /// Output relay state; anything other than a JSON boolean reads as off
    #[serde(default, deserialize_with = "lenient_or_default")]
    pub output: bool,
    #[serde(default, deserialize_with = "lenient")]
    pub timer_started_at: Option<i64>,
    #[serde(default, deserialize_with = "lenient")]
    pub timer_duration: Option<i64>,
    /// Active power in W
    #[serde(rename = "apower", default, deserialize_with = "lenient")]
    pub active_power: Option<f64>,
    /// Voltage in V
    #[serde(default, deserialize_with = "lenient")]
    pub voltage: Option<f64>,
    /// Current in A
    #[serde(default, deserialize_with = "lenient")]
    pub current: Option<f64>,
    #[serde(rename = "pf", default, deserialize_with = "lenient")]
    pub power_factor: Option<f64>,
    /// Frequency in Hz
    #[serde(rename = "freq", default, deserialize_with = "lenient")]
    pub frequency: Option<f64>,
    #[serde(rename = "aenergy", default, deserialize_with = "lenient_object")]
    pub energy: Option<EnergyCounter>,
    #[serde(rename = "ret_aenergy", default, deserialize_with = "lenient_object")]
    pub returned_energy: Option<EnergyCounter>,
    #[serde(default, deserialize_with = "lenient_object")]
    pub temperature: Option<Temperature>,
    /// overtemp, overpower, overvoltage, undervoltage
    #[serde(default, deserialize_with = "lenient_or_default")]
    pub errors: Vec<String>,
}

impl TelemetrySample {
    /// Decode a raw payload. Never fails; unparseable input yields an
    /// all-absent sample with the output reading off.
    pub fn decode(payload: &[u8]) -> Self {
        let value = match serde_json::from_slice::<serde_json::Value>(payload) {
            Ok(value @ serde_json::Value::Object(_)) => value,
            Ok(_) => {
                debug!(bytes = payload.len(), "telemetry_not_an_object");
                return Self::default();
            }
            Err(e) => {
                debug!(error = %e, bytes = payload.len(), "telemetry_decode_failed");
                return Self::default();
            }
        };
        serde_json::from_value(value).unwrap_or_else(|e| {
            debug!(error = %e, bytes = payload.len(), "telemetry_decode_failed");
            Self::default()
        })
    }

    /// Output state as a gauge value (1.0 on, 0.0 off)
    pub fn output_value(&self) -> f64 {
        if self.output {
            1.0
        } else {
            0.0
        }
    }
}
