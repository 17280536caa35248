//! Outside temperature lookup.

use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::config::WeatherConfig;

/// Weather lookup failures.
#[derive(Debug, Error)]
pub enum WeatherError {
    #[error("Weather request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Weather provider returned HTTP {0}")]
    Status(u16),

    #[error("Weather response has no temperature")]
    MissingField,
}

#[derive(Debug, Deserialize)]
struct WeatherResponse {
    main: Option<MainSection>,
}

#[derive(Debug, Deserialize)]
struct MainSection {
    temp: Option<f64>,
}

/// Client for the weather provider.
#[derive(Debug, Clone)]
pub struct WeatherClient {
    client: reqwest::Client,
    url: String,
    api_key: String,
    city_id: String,
}

impl WeatherClient {
    pub fn new(
        url: impl Into<String>,
        api_key: impl Into<String>,
        city_id: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, WeatherError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
            api_key: api_key.into(),
            city_id: city_id.into(),
        })
    }

    /// Build a client if enrichment is enabled.
    pub fn from_config(config: &WeatherConfig) -> Result<Option<Self>, WeatherError> {
        if !config.enabled {
            return Ok(None);
        }
        Self::new(
            &config.url,
            &config.api_key,
            &config.city_id,
            config.timeout(),
        )
        .map(Some)
    }

    /// Current temperature in °C.
    pub async fn fetch_temperature(&self) -> Result<f64, WeatherError> {
        let response = self
            .client
            .get(&self.url)
            .query(&[
                ("id", self.city_id.as_str()),
                ("units", "metric"),
                ("appid", self.api_key.as_str()),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(WeatherError::Status(status.as_u16()));
        }

        let body: WeatherResponse = response.json().await?;
        let temp = body
            .main
            .and_then(|m| m.temp)
            .ok_or(WeatherError::MissingField)?;

        debug!(temperature = temp, "Fetched outside temperature");
        Ok(temp)
    }
}
