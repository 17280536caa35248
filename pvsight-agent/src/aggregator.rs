//! Snapshot aggregation over the state store.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;

use crate::exporter::ExportError;
use crate::state::{MetricGroup, MetricKey, StateStore};

/// One export tick's view of the installation.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    /// Summed solar yield in kWh.
    pub generated_energy_kwh: f64,
    /// Summed grid and inverter energy in kWh.
    pub consumed_energy_kwh: f64,
    /// Instantaneous PV power in W.
    pub generated_power: f64,
    /// Instantaneous AC consumption in W.
    pub consumed_power: f64,
    /// Inverter AC output voltage, when known.
    pub ac_voltage: Option<f64>,
    /// Outside temperature in °C, when enriched.
    pub temperature: Option<f64>,
    pub timestamp: DateTime<Tz>,
}

impl Snapshot {
    pub fn with_temperature(mut self, temperature: Option<f64>) -> Self {
        self.temperature = temperature;
        self
    }

    /// Date in `YYYYMMDD` form.
    pub fn date(&self) -> String {
        self.timestamp.format("%Y%m%d").to_string()
    }

    /// Time of day in `HH:MM` form.
    pub fn time(&self) -> String {
        self.timestamp.format("%H:%M").to_string()
    }
}

/// Builds snapshots in a fixed time zone.
#[derive(Debug, Clone, Copy)]
pub struct Aggregator {
    tz: Tz,
}

impl Aggregator {
    pub fn new(tz: Tz) -> Self {
        Self { tz }
    }

    pub fn timezone(&self) -> Tz {
        self.tz
    }

    /// Aggregate the store at `now`.
    ///
    /// Energy groups sum whatever is present. Both power readings have to
    /// be set; the voltage is optional.
    pub fn snapshot(&self, store: &StateStore, now: DateTime<Utc>) -> Result<Snapshot, ExportError> {
        let generated_power = store
            .get(&MetricKey::GeneratedPower)
            .as_f64()
            .ok_or(ExportError::MissingReading("generated power"))?;
        let consumed_power = store
            .get(&MetricKey::ConsumedPower)
            .as_f64()
            .ok_or(ExportError::MissingReading("consumed power"))?;

        Ok(Snapshot {
            generated_energy_kwh: store.sum(MetricGroup::GeneratedEnergy),
            consumed_energy_kwh: store.sum(MetricGroup::ConsumedEnergy),
            generated_power,
            consumed_power,
            ac_voltage: store.get(&MetricKey::AcOutVoltage).as_f64(),
            temperature: None,
            timestamp: now.with_timezone(&self.tz),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Reading;
    use chrono::TimeZone;

    fn populated() -> StateStore {
        let mut store = StateStore::new();
        store.set(MetricKey::SolarYield("a".into()), Reading::Float(3.0));
        store.set(MetricKey::SolarYield("b".into()), Reading::Float(2.2));
        store.register(MetricKey::SolarYield("c".into()));
        store.set(MetricKey::GridImport("m".into()), Reading::Float(1.6));
        store.set(MetricKey::InverterToAcOut, Reading::Float(1.0));
        store.set(MetricKey::InverterToAcIn, Reading::Float(0.5));
        store.set(MetricKey::GeneratedPower, Reading::Integer(1450));
        store.set(MetricKey::ConsumedPower, Reading::Float(612.7));
        store
    }

    fn noon_utc() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 5, 0).unwrap()
    }

    #[test]
    fn test_snapshot_sums_groups() {
        let snapshot = Aggregator::new(Tz::UTC)
            .snapshot(&populated(), noon_utc())
            .unwrap();

        assert!((snapshot.generated_energy_kwh - 5.2).abs() < 1e-9);
        assert!((snapshot.consumed_energy_kwh - 3.1).abs() < 1e-9);
        assert_eq!(snapshot.generated_power, 1450.0);
        assert_eq!(snapshot.consumed_power, 612.7);
        assert_eq!(snapshot.ac_voltage, None);
        assert_eq!(snapshot.temperature, None);
    }

    #[test]
    fn test_snapshot_uses_timezone() {
        let snapshot = Aggregator::new(chrono_tz::Europe::Amsterdam)
            .snapshot(&populated(), noon_utc())
            .unwrap();
        assert_eq!(snapshot.date(), "20240601");
        assert_eq!(snapshot.time(), "14:05");

        let late = Utc.with_ymd_and_hms(2024, 6, 1, 23, 30, 0).unwrap();
        let snapshot = Aggregator::new(chrono_tz::Europe::Amsterdam)
            .snapshot(&populated(), late)
            .unwrap();
        assert_eq!(snapshot.date(), "20240602");
        assert_eq!(snapshot.time(), "01:30");
    }

    #[test]
    fn test_voltage_included_when_set() {
        let mut store = populated();
        store.set(MetricKey::AcOutVoltage, Reading::Float(231.4));
        let snapshot = Aggregator::new(Tz::UTC).snapshot(&store, noon_utc()).unwrap();
        assert_eq!(snapshot.ac_voltage, Some(231.4));
    }

    #[test]
    fn test_missing_power_is_an_error() {
        let mut store = populated();
        store.set(MetricKey::ConsumedPower, Reading::Unset);
        let err = Aggregator::new(Tz::UTC)
            .snapshot(&store, noon_utc())
            .unwrap_err();
        assert!(matches!(err, ExportError::MissingReading("consumed power")));
    }

    #[test]
    fn test_empty_energy_groups_are_zero() {
        let mut store = StateStore::new();
        store.set(MetricKey::GeneratedPower, Reading::Integer(0));
        store.set(MetricKey::ConsumedPower, Reading::Integer(0));
        let snapshot = Aggregator::new(Tz::UTC).snapshot(&store, noon_utc()).unwrap();
        assert_eq!(snapshot.generated_energy_kwh, 0.0);
        assert_eq!(snapshot.consumed_energy_kwh, 0.0);
    }
}
