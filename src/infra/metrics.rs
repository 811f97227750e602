//! Metric registry - label-keyed gauges for switch telemetry
//!
//! Every gauge family maps a `{device, index}` label combination to its last
//! written value. Values live in `AtomicU64` cells (f64 bits) so a scrape never
//! observes a torn write; the per-family map is behind a `RwLock` that is only
//! taken for writing when a new label combination shows up.
//!
//! Entries are never evicted. A device that stops reporting keeps its last
//! values until the process restarts.

use crate::domain::telemetry::TelemetrySample;
use crate::infra::labels::SAMPLE_LABEL_KEYS;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

/// Wrong number of label values passed to [`MetricRegistry::update`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("expected {expected} label values, got {got}")]
pub struct LabelCardinalityError {
    pub expected: usize,
    pub got: usize,
}

/// The fixed set of gauges exported per switch channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Gauge {
    Output,
    ActivePower,
    Voltage,
    Current,
    Frequency,
    EnergyTotal,
    ReturnedEnergyTotal,
    EnergyLastMinute,
    ReturnedEnergyLastMinute,
    Temperature,
}

impl Gauge {
    pub const ALL: [Gauge; 10] = [
        Gauge::Output,
        Gauge::ActivePower,
        Gauge::Voltage,
        Gauge::Current,
        Gauge::Frequency,
        Gauge::EnergyTotal,
        Gauge::ReturnedEnergyTotal,
        Gauge::EnergyLastMinute,
        Gauge::ReturnedEnergyLastMinute,
        Gauge::Temperature,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Gauge::Output => "shelly_output",
            Gauge::ActivePower => "shelly_apower",
            Gauge::Voltage => "shelly_voltage",
            Gauge::Current => "shelly_current",
            Gauge::Frequency => "shelly_freq",
            Gauge::EnergyTotal => "shelly_energy_total_wh",
            Gauge::ReturnedEnergyTotal => "shelly_returned_energy_total_wh",
            Gauge::EnergyLastMinute => "shelly_energy_minute_0_mwh",
            Gauge::ReturnedEnergyLastMinute => "shelly_returned_energy_minute_0_mwh",
            Gauge::Temperature => "shelly_temperature_celsius",
        }
    }

    pub fn help(self) -> &'static str {
        match self {
            Gauge::Output => "Switch output state",
            Gauge::ActivePower => "Active power in Watts",
            Gauge::Voltage => "Voltage in Volts",
            Gauge::Current => "Current in Amps",
            Gauge::Frequency => "Frequency in Hz",
            Gauge::EnergyTotal => "Total energy in Wh",
            Gauge::ReturnedEnergyTotal => "Returned energy in Wh",
            Gauge::EnergyLastMinute => "Energy in mWh from minute -1",
            Gauge::ReturnedEnergyLastMinute => "Returned energy in mWh from minute -1",
            Gauge::Temperature => "Temperature in Celsius",
        }
    }

    fn slot(self) -> usize {
        self as usize
    }
}

/// Label values for one sample, in `SAMPLE_LABEL_KEYS` order
type SeriesKey = Box<[String]>;

/// One gauge family: label combination -> last value
struct GaugeFamily {
    series: RwLock<FxHashMap<SeriesKey, AtomicU64>>,
}

impl GaugeFamily {
    fn new() -> Self {
        Self { series: RwLock::new(FxHashMap::default()) }
    }

    fn set(&self, key: &SeriesKey, value: f64) {
        {
            let series = self.series.read();
            if let Some(cell) = series.get(key) {
                cell.store(value.to_bits(), Ordering::Relaxed);
                return;
            }
        }
        // First sighting of this label combination
        let mut series = self.series.write();
        series
            .entry(key.clone())
            .or_insert_with(|| AtomicU64::new(0))
            .store(value.to_bits(), Ordering::Relaxed);
    }

    fn get(&self, label_values: &[&str]) -> Option<f64> {
        let key: SeriesKey = label_values.iter().map(|v| v.to_string()).collect();
        self.series.read().get(&key).map(|cell| f64::from_bits(cell.load(Ordering::Relaxed)))
    }

    fn snapshot(&self) -> Vec<(SeriesKey, f64)> {
        let series = self.series.read();
        let mut out: Vec<(SeriesKey, f64)> = series
            .iter()
            .map(|(key, cell)| (key.clone(), f64::from_bits(cell.load(Ordering::Relaxed))))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }
}

/// Point-in-time view of one series
#[derive(Debug, Clone, PartialEq)]
pub struct SeriesSnapshot {
    /// Constant labels first, then `device`, `index`
    pub labels: Vec<(String, String)>,
    pub value: f64,
}

/// Point-in-time view of one gauge family, ready for exposition
#[derive(Debug, Clone, PartialEq)]
pub struct FamilySnapshot {
    pub name: &'static str,
    pub help: &'static str,
    pub series: Vec<SeriesSnapshot>,
}

/// Process-wide gauge state, shared by the topic router and the HTTP handler
pub struct MetricRegistry {
    const_labels: Vec<(String, String)>,
    families: [GaugeFamily; Gauge::ALL.len()],
}

impl MetricRegistry {
    /// Create a registry whose every series carries `const_labels`
    pub fn new(const_labels: BTreeMap<String, String>) -> Self {
        Self {
            const_labels: const_labels.into_iter().collect(),
            families: std::array::from_fn(|_| GaugeFamily::new()),
        }
    }

    pub fn const_labels(&self) -> &[(String, String)] {
        &self.const_labels
    }

    /// Fold one sample into the gauges at `label_values` (`[device, index]`)
    ///
    /// Absent fields leave the existing value untouched. The output state is
    /// always written. Of the per-minute energy history only element 0 is kept.
    pub fn update(
        &self,
        sample: &TelemetrySample,
        label_values: &[&str],
    ) -> Result<(), LabelCardinalityError> {
        if label_values.len() != SAMPLE_LABEL_KEYS.len() {
            return Err(LabelCardinalityError {
                expected: SAMPLE_LABEL_KEYS.len(),
                got: label_values.len(),
            });
        }
        let key: SeriesKey = label_values.iter().map(|v| v.to_string()).collect();

        self.set(Gauge::Output, &key, Some(sample.output_value()));
        self.set(Gauge::ActivePower, &key, sample.active_power);
        self.set(Gauge::Voltage, &key, sample.voltage);
        self.set(Gauge::Current, &key, sample.current);
        self.set(Gauge::Frequency, &key, sample.frequency);

        if let Some(energy) = &sample.energy {
            self.set(Gauge::EnergyTotal, &key, energy.total);
            self.set(Gauge::EnergyLastMinute, &key, energy.last_minute());
        }
        if let Some(returned) = &sample.returned_energy {
            self.set(Gauge::ReturnedEnergyTotal, &key, returned.total);
            self.set(Gauge::ReturnedEnergyLastMinute, &key, returned.last_minute());
        }
        if let Some(temperature) = &sample.temperature {
            self.set(Gauge::Temperature, &key, temperature.celsius);
        }

        Ok(())
    }

    #[inline]
    fn set(&self, gauge: Gauge, key: &SeriesKey, value: Option<f64>) {
        if let Some(value) = value {
            self.families[gauge.slot()].set(key, value);
        }
    }

    /// Current value of `gauge` at `label_values`, if ever written
    pub fn get(&self, gauge: Gauge, label_values: &[&str]) -> Option<f64> {
        self.families[gauge.slot()].get(label_values)
    }

    /// Number of distinct label combinations seen by `gauge`
    pub fn series_count(&self, gauge: Gauge) -> usize {
        self.families[gauge.slot()].series.read().len()
    }

    /// Snapshot of all families, in `Gauge::ALL` order, series sorted by label values
    pub fn gather(&self) -> Vec<FamilySnapshot> {
        Gauge::ALL
            .iter()
            .map(|&gauge| FamilySnapshot {
                name: gauge.name(),
                help: gauge.help(),
                series: self.families[gauge.slot()]
                    .snapshot()
                    .into_iter()
                    .map(|(key, value)| SeriesSnapshot { labels: self.full_labels(&key), value })
                    .collect(),
            })
            .collect()
    }

    fn full_labels(&self, key: &SeriesKey) -> Vec<(String, String)> {
        let mut labels = Vec::with_capacity(self.const_labels.len() + key.len());
        labels.extend(self.const_labels.iter().cloned());
        labels.extend(
            SAMPLE_LABEL_KEYS.iter().zip(key.iter()).map(|(k, v)| (k.to_string(), v.clone())),
        );
        labels
    }
}

impl Default for MetricRegistry {
    fn default() -> Self {
        Self::new(BTreeMap::new())
    }
}
