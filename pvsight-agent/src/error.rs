//! Startup error types.

use thiserror::Error;

use crate::bus::BusError;
use crate::config::ConfigError;
use crate::state::WriterClosed;

/// Result type alias using [`StartupError`].
pub type Result<T> = std::result::Result<T, StartupError>;

/// Errors that abort agent startup.
///
/// Nothing on the periodic export path produces one of these.
#[derive(Debug, Error)]
pub enum StartupError {
    /// The configuration failed validation.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The bus could not be enumerated.
    #[error("Service discovery unavailable: {0}")]
    DiscoveryUnavailable(#[source] BusError),

    /// A singleton endpoint the agent cannot work without is absent.
    #[error("Required endpoint missing: {0}")]
    RequiredEndpointMissing(String),

    /// A tracked property could not be subscribed to.
    #[error("Failed to track {key}: {source}")]
    Subscribe {
        key: String,
        #[source]
        source: BusError,
    },

    /// The state writer stopped before startup finished.
    #[error(transparent)]
    WriterClosed(#[from] WriterClosed),

    /// An HTTP client could not be built from the configuration.
    #[error("HTTP client error: {0}")]
    Client(String),
}

impl StartupError {
    /// Create a required-endpoint error.
    pub fn missing(what: impl Into<String>) -> Self {
        Self::RequiredEndpointMissing(what.into())
    }
}
