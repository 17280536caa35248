//! Service discovery and the tracked-metric layout of an installation.

use std::fmt;

use tracing::{debug, info, warn};

use crate::bus::{BusError, PropertyBus, RawValue};
use crate::error::{Result, StartupError};
use crate::state::MetricKey;
use crate::tracker::TrackedMetric;

/// Common prefix of every device service name.
pub const SERVICE_PREFIX: &str = "com.victronenergy";

/// The singleton system aggregator.
pub const SYSTEM_SERVICE: &str = "com.victronenergy.system";

/// The singleton settings service.
pub const SETTINGS_SERVICE: &str = "com.victronenergy.settings";

/// Property paths read by the agent.
pub mod paths {
    pub const SOLAR_YIELD: &str = "/Yield/User";
    pub const GRID_FORWARD: &str = "/Ac/L1/Energy/Forward";
    pub const VEBUS_SERVICE: &str = "/VebusService";
    pub const INVERTER_TO_AC_OUT: &str = "/Energy/InverterToAcOut";
    pub const INVERTER_TO_AC_IN: &str = "/Energy/InverterToAcIn1";
    pub const AC_OUT_VOLTAGE: &str = "/Ac/Out/L1/V";
    pub const CONSUMPTION_POWER: &str = "/Ac/Consumption/L1/Power";
    pub const PV_POWER: &str = "/Dc/Pv/Power";
    pub const TIME_ZONE: &str = "/Settings/System/TimeZone";
}

/// Device role of a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    SolarCharger,
    Grid,
    System,
    Vebus,
    Settings,
}

impl Category {
    /// Category segment of the service name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::SolarCharger => "solarcharger",
            Category::Grid => "grid",
            Category::System => "system",
            Category::Vebus => "vebus",
            Category::Settings => "settings",
        }
    }

    /// Name prefix shared by every service of this category.
    pub fn prefix(&self) -> String {
        format!("{}.{}", SERVICE_PREFIX, self.as_str())
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A discovered bus service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub name: String,
    pub category: Category,
}

impl Endpoint {
    pub fn new(name: impl Into<String>, category: Category) -> Self {
        Self {
            name: name.into(),
            category,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// List the live services whose name starts with the category prefix.
///
/// Order follows the transport; no matches is an empty list.
pub async fn find_services(
    bus: &dyn PropertyBus,
    category: Category,
) -> std::result::Result<Vec<Endpoint>, BusError> {
    let prefix = category.prefix();
    let endpoints: Vec<Endpoint> = bus
        .list_names()
        .await?
        .into_iter()
        .filter(|name| name.starts_with(&prefix))
        .map(|name| Endpoint::new(name, category))
        .collect();

    debug!(category = %category, count = endpoints.len(), "Discovered services");
    Ok(endpoints)
}

/// Every endpoint the agent tracks.
#[derive(Debug, Clone)]
pub struct Topology {
    pub solar_chargers: Vec<Endpoint>,
    pub grid_meters: Vec<Endpoint>,
    pub system: Endpoint,
    pub vebus: Endpoint,
}

impl Topology {
    /// Discover the installation.
    ///
    /// Solar chargers and grid meters may be absent. The system service
    /// must be live and must name a live inverter in `/VebusService`.
    pub async fn discover(bus: &dyn PropertyBus) -> Result<Self> {
        let solar_chargers = find_services(bus, Category::SolarCharger)
            .await
            .map_err(StartupError::DiscoveryUnavailable)?;
        let grid_meters = find_services(bus, Category::Grid)
            .await
            .map_err(StartupError::DiscoveryUnavailable)?;

        let system = find_services(bus, Category::System)
            .await
            .map_err(StartupError::DiscoveryUnavailable)?
            .into_iter()
            .find(|e| e.name == SYSTEM_SERVICE)
            .ok_or_else(|| StartupError::missing(SYSTEM_SERVICE))?;

        let vebus_name = match bus.get_value(&system.name, paths::VEBUS_SERVICE).await {
            Ok(RawValue::String(name)) if !name.is_empty() => name,
            Ok(other) => {
                return Err(StartupError::missing(format!(
                    "inverter ({}{} is {})",
                    SYSTEM_SERVICE,
                    paths::VEBUS_SERVICE,
                    other
                )));
            }
            Err(e) => {
                return Err(StartupError::missing(format!(
                    "inverter ({}{} unreadable: {})",
                    SYSTEM_SERVICE,
                    paths::VEBUS_SERVICE,
                    e
                )));
            }
        };

        let vebus = find_services(bus, Category::Vebus)
            .await
            .map_err(StartupError::DiscoveryUnavailable)?
            .into_iter()
            .find(|e| e.name == vebus_name)
            .ok_or_else(|| StartupError::missing(vebus_name.clone()))?;

        if solar_chargers.is_empty() {
            warn!("No solar chargers found; generated energy will read 0");
        }

        let topology = Self {
            solar_chargers,
            grid_meters,
            system,
            vebus,
        };
        topology.log_summary();
        Ok(topology)
    }

    /// Bindings of every tracked property to its logical key.
    pub fn tracked_metrics(&self) -> Vec<TrackedMetric> {
        let mut metrics = Vec::new();

        for charger in &self.solar_chargers {
            metrics.push(TrackedMetric::new(
                charger.clone(),
                paths::SOLAR_YIELD,
                MetricKey::SolarYield(charger.name.clone()),
            ));
        }
        for meter in &self.grid_meters {
            metrics.push(TrackedMetric::new(
                meter.clone(),
                paths::GRID_FORWARD,
                MetricKey::GridImport(meter.name.clone()),
            ));
        }

        metrics.push(TrackedMetric::new(
            self.vebus.clone(),
            paths::INVERTER_TO_AC_OUT,
            MetricKey::InverterToAcOut,
        ));
        metrics.push(TrackedMetric::new(
            self.vebus.clone(),
            paths::INVERTER_TO_AC_IN,
            MetricKey::InverterToAcIn,
        ));
        metrics.push(TrackedMetric::new(
            self.vebus.clone(),
            paths::AC_OUT_VOLTAGE,
            MetricKey::AcOutVoltage,
        ));
        metrics.push(TrackedMetric::new(
            self.system.clone(),
            paths::CONSUMPTION_POWER,
            MetricKey::ConsumedPower,
        ));
        metrics.push(TrackedMetric::new(
            self.system.clone(),
            paths::PV_POWER,
            MetricKey::GeneratedPower,
        ));

        metrics
    }

    /// Names of all discovered endpoints.
    pub fn endpoint_names(&self) -> Vec<&str> {
        self.solar_chargers
            .iter()
            .chain(&self.grid_meters)
            .chain([&self.system, &self.vebus])
            .map(|e| e.name.as_str())
            .collect()
    }

    fn log_summary(&self) {
        for e in &self.solar_chargers {
            info!(endpoint = %e, "Found solar charger");
        }
        for e in &self.grid_meters {
            info!(endpoint = %e, "Found grid meter");
        }
        info!(endpoint = %self.system, "Found system");
        info!(endpoint = %self.vebus, "Found inverter");
    }
}
