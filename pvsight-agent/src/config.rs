//! Configuration for the telemetry agent.

use pvsight_common::config::{LoggingConfig, ZenohConfig};
use pvsight_common::keyexpr::DEFAULT_BUS_ROOT;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] json5::Error),
    #[error("Validation error: {0}")]
    Validation(String),
}

/// Complete agent configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Zenoh connection settings
    #[serde(default)]
    pub zenoh: ZenohConfig,

    /// Property bus layout and query limits
    #[serde(default)]
    pub bus: BusConfig,

    /// Metrics collector upload settings
    pub pvoutput: PvOutputConfig,

    /// Optional weather enrichment
    #[serde(default)]
    pub weather: WeatherConfig,

    /// IANA time zone override (e.g. "Europe/Amsterdam")
    #[serde(default)]
    pub timezone: Option<String>,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Property bus settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Key expression root under which services publish (default: "venus")
    #[serde(default = "default_key_root")]
    pub key_root: String,

    /// Timeout for a single value query in milliseconds
    #[serde(default = "default_query_timeout_ms")]
    pub query_timeout_ms: u64,
}

fn default_key_root() -> String {
    DEFAULT_BUS_ROOT.to_string()
}

fn default_query_timeout_ms() -> u64 {
    2000
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            key_root: default_key_root(),
            query_timeout_ms: default_query_timeout_ms(),
        }
    }
}

impl BusConfig {
    /// Get the query timeout as Duration.
    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }
}

/// Upload settings for the remote metrics collector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PvOutputConfig {
    /// Status endpoint URL
    #[serde(default = "default_pvoutput_url")]
    pub url: String,

    /// API key sent in the API key header
    pub api_key: String,

    /// System identifier sent in the system id header
    pub system_id: String,

    /// Header carrying the API key
    #[serde(default = "default_api_key_header")]
    pub api_key_header: String,

    /// Header carrying the system identifier
    #[serde(default = "default_system_id_header")]
    pub system_id_header: String,

    /// Upload interval in seconds
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,

    /// Per-request timeout in seconds
    #[serde(default = "default_upload_timeout_secs")]
    pub timeout_secs: u64,

    /// Retry policy for transient failures
    #[serde(default)]
    pub retry: RetryConfig,
}

fn default_pvoutput_url() -> String {
    "https://pvoutput.org/service/r2/addstatus.jsp".to_string()
}

fn default_api_key_header() -> String {
    "X-Apikey".to_string()
}

fn default_system_id_header() -> String {
    "X-SystemId".to_string()
}

fn default_interval_secs() -> u64 {
    300
}

fn default_upload_timeout_secs() -> u64 {
    30
}

impl PvOutputConfig {
    /// Get the upload interval as Duration.
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// Get the request timeout as Duration.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Retry settings for uploads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries after the first attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay before the first retry in milliseconds; doubles on each retry
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Upper bound for a single backoff delay in milliseconds
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// HTTP statuses treated as transient
    #[serde(default = "default_retry_statuses")]
    pub retry_statuses: Vec<u16>,
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    300
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

fn default_retry_statuses() -> Vec<u16> {
    vec![500, 502, 504]
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            retry_statuses: default_retry_statuses(),
        }
    }
}

/// Weather enrichment settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeatherConfig {
    /// Whether to query the weather provider on each tick
    #[serde(default)]
    pub enabled: bool,

    /// Provider API key
    #[serde(default)]
    pub api_key: String,

    /// Provider location identifier
    #[serde(default)]
    pub city_id: String,

    /// Provider endpoint
    #[serde(default = "default_weather_url")]
    pub url: String,

    /// Request timeout in seconds
    #[serde(default = "default_weather_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_weather_url() -> String {
    "https://api.openweathermap.org/data/2.5/weather".to_string()
}

fn default_weather_timeout_secs() -> u64 {
    10
}

impl Default for WeatherConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            api_key: String::new(),
            city_id: String::new(),
            url: default_weather_url(),
            timeout_secs: default_weather_timeout_secs(),
        }
    }
}

impl WeatherConfig {
    /// Get the request timeout as Duration.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl AgentConfig {
    /// Load configuration from a JSON5 file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: AgentConfig = json5::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bus.key_root.trim_matches('/').is_empty() {
            return Err(ConfigError::Validation(
                "bus.key_root cannot be empty".to_string(),
            ));
        }
        if self.bus.query_timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "bus.query_timeout_ms must be greater than 0".to_string(),
            ));
        }

        let pv = &self.pvoutput;
        if pv.url.is_empty() {
            return Err(ConfigError::Validation(
                "pvoutput.url cannot be empty".to_string(),
            ));
        }
        if pv.api_key.is_empty() || pv.system_id.is_empty() {
            return Err(ConfigError::Validation(
                "pvoutput.api_key and pvoutput.system_id are required".to_string(),
            ));
        }
        if pv.interval_secs == 0 {
            return Err(ConfigError::Validation(
                "pvoutput.interval_secs must be greater than 0".to_string(),
            ));
        }
        if pv.timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "pvoutput.timeout_secs must be greater than 0".to_string(),
            ));
        }
        if let Some(status) = pv
            .retry
            .retry_statuses
            .iter()
            .find(|s| !(100..=599).contains(*s))
        {
            return Err(ConfigError::Validation(format!(
                "pvoutput.retry.retry_statuses: {} is not an HTTP status",
                status
            )));
        }

        if self.weather.enabled && (self.weather.api_key.is_empty() || self.weather.city_id.is_empty())
        {
            return Err(ConfigError::Validation(
                "weather.api_key and weather.city_id are required when weather is enabled"
                    .to_string(),
            ));
        }
        if self.weather.enabled && self.weather.timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "weather.timeout_secs must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}
