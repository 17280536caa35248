/// Default key expression root of the property bus.
pub const DEFAULT_BUS_ROOT: &str = "venus";

/// Builder for property-bus key expressions.
///
/// Key expressions follow the pattern:
/// `<root>/<service>/<property_path>`
///
/// Service presence is announced with liveliness tokens at
/// `<root>/@/services/<service>`.
#[derive(Debug, Clone)]
pub struct BusKeys {
    root: String,
}

impl BusKeys {
    /// Create a builder for the given root.
    pub fn new(root: impl Into<String>) -> Self {
        let root: String = root.into();
        Self {
            root: root.trim_end_matches('/').to_string(),
        }
    }

    /// The root segment.
    pub fn root(&self) -> &str {
        &self.root
    }

    /// Key expression of a single property.
    ///
    /// # Example
    /// ```
    /// use pvsight_common::keyexpr::BusKeys;
    ///
    /// let keys = BusKeys::new("venus");
    /// assert_eq!(
    ///     keys.property("com.victronenergy.system", "/Dc/Pv/Power"),
    ///     "venus/com.victronenergy.system/Dc/Pv/Power"
    /// );
    /// ```
    pub fn property(&self, service: &str, path: &str) -> String {
        format!("{}/{}/{}", self.root, service, path.trim_start_matches('/'))
    }

    /// Liveliness key announcing a service.
    ///
    /// # Example
    /// ```
    /// use pvsight_common::keyexpr::BusKeys;
    ///
    /// let keys = BusKeys::new("venus");
    /// assert_eq!(
    ///     keys.service_alive("com.victronenergy.grid.cgwacs_ttyUSB0"),
    ///     "venus/@/services/com.victronenergy.grid.cgwacs_ttyUSB0"
    /// );
    /// ```
    pub fn service_alive(&self, service: &str) -> String {
        format!("{}/@/services/{}", self.root, service)
    }

    /// Wildcard matching every service liveliness token.
    pub fn services_wildcard(&self) -> String {
        format!("{}/@/services/*", self.root)
    }

    /// Key where the agent publishes its own status.
    pub fn agent_status(&self, agent: &str) -> String {
        format!("{}/@/{}/status", self.root, agent)
    }

    /// Extract the service name from a liveliness key.
    ///
    /// Returns `None` if the key does not belong to this root.
    pub fn parse_service<'a>(&self, key: &'a str) -> Option<&'a str> {
        let rest = key.strip_prefix(self.root.as_str())?;
        let service = rest.strip_prefix("/@/services/")?;
        if service.is_empty() || service.contains('/') {
            None
        } else {
            Some(service)
        }
    }
}

impl Default for BusKeys {
    fn default() -> Self {
        Self::new(DEFAULT_BUS_ROOT)
    }
}
