//! Upload of snapshots to the remote metrics collector.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::aggregator::Snapshot;
use crate::config::PvOutputConfig;
use crate::retry::RetryPolicy;

/// Errors on the export path. None of them stop the agent.
#[derive(Debug, Error)]
pub enum ExportError {
    /// A reading without an absent representation in the payload is unset.
    #[error("No reading for {0}")]
    MissingReading(&'static str),

    /// The request never produced a response.
    #[error("Upload failed after {attempts} attempt(s): {source}")]
    Transport {
        attempts: u32,
        #[source]
        source: reqwest::Error,
    },

    /// The collector answered with a non-success status.
    #[error("Upload rejected with HTTP {status} after {attempts} attempt(s): {body}")]
    Rejected {
        status: u16,
        attempts: u32,
        body: String,
    },

    /// A configured header name or value is not valid HTTP.
    #[error("Invalid header: {0}")]
    InvalidHeader(String),

    /// The HTTP client could not be built.
    #[error("Failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),
}

impl ExportError {
    /// Requests made before giving up.
    pub fn attempts(&self) -> u32 {
        match self {
            ExportError::Transport { attempts, .. } | ExportError::Rejected { attempts, .. } => {
                *attempts
            }
            _ => 0,
        }
    }
}

/// Convert kWh to Wh, truncating toward zero.
pub fn to_watt_hours(kwh: f64) -> i64 {
    (kwh * 1000.0).trunc() as i64
}

/// Form body of one status upload.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UploadPayload {
    /// `YYYYMMDD`
    #[serde(rename = "d")]
    pub date: String,
    /// `HH:MM`
    #[serde(rename = "t")]
    pub time: String,
    #[serde(rename = "v1")]
    pub generated_wh: i64,
    #[serde(rename = "v2")]
    pub generated_power: i64,
    #[serde(rename = "v3")]
    pub consumed_wh: i64,
    #[serde(rename = "v4")]
    pub consumed_power: i64,
    #[serde(rename = "v5", skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(rename = "v6", skip_serializing_if = "Option::is_none")]
    pub voltage: Option<f64>,
    /// Energy values are cumulative.
    #[serde(rename = "c1")]
    pub cumulative: u8,
}

impl UploadPayload {
    pub fn from_snapshot(snapshot: &Snapshot) -> Self {
        Self {
            date: snapshot.date(),
            time: snapshot.time(),
            generated_wh: to_watt_hours(snapshot.generated_energy_kwh),
            generated_power: snapshot.generated_power.trunc() as i64,
            consumed_wh: to_watt_hours(snapshot.consumed_energy_kwh),
            consumed_power: snapshot.consumed_power.trunc() as i64,
            temperature: snapshot.temperature,
            voltage: snapshot.ac_voltage,
            cumulative: 1,
        }
    }
}

/// Outcome of a successful upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadReceipt {
    pub status: u16,
    pub attempts: u32,
}

/// Destination for status payloads.
#[async_trait]
pub trait StatusSink: Send + Sync {
    async fn upload(&self, payload: &UploadPayload) -> Result<UploadReceipt, ExportError>;
}

/// POSTs payloads to the collector with bounded retry.
#[derive(Debug, Clone)]
pub struct Uploader {
    client: reqwest::Client,
    url: String,
    headers: HeaderMap,
    policy: RetryPolicy,
}

impl Uploader {
    /// Build an uploader from its configuration.
    pub fn new(config: &PvOutputConfig) -> Result<Self, ExportError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(ExportError::Client)?;

        let mut headers = HeaderMap::new();
        headers.insert(
            header_name(&config.api_key_header)?,
            header_value(&config.api_key)?,
        );
        headers.insert(
            header_name(&config.system_id_header)?,
            header_value(&config.system_id)?,
        );

        Ok(Self {
            client,
            url: config.url.clone(),
            headers,
            policy: RetryPolicy::from(&config.retry),
        })
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Upload one payload.
    ///
    /// Transient failures are retried with backoff, up to
    /// `max_retries` retries. Anything else is returned at once.
    pub async fn upload(&self, payload: &UploadPayload) -> Result<UploadReceipt, ExportError> {
        let max_attempts = self.policy.max_attempts();
        let mut attempts = 0;

        loop {
            attempts += 1;
            let result = self
                .client
                .post(&self.url)
                .headers(self.headers.clone())
                .form(payload)
                .send()
                .await;

            match result {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        debug!(status = status.as_u16(), attempts, "Upload accepted");
                        return Ok(UploadReceipt {
                            status: status.as_u16(),
                            attempts,
                        });
                    }

                    let code = status.as_u16();
                    let body = response.text().await.unwrap_or_default();
                    if !self.policy.is_retryable_status(code) || attempts >= max_attempts {
                        return Err(ExportError::Rejected {
                            status: code,
                            attempts,
                            body,
                        });
                    }
                    warn!(status = code, attempt = attempts, "Transient upload failure");
                }
                Err(e) => {
                    if !self.policy.is_retryable_error(&e) || attempts >= max_attempts {
                        return Err(ExportError::Transport {
                            attempts,
                            source: e,
                        });
                    }
                    warn!(error = %e, attempt = attempts, "Upload request failed");
                }
            }

            let delay = self.policy.backoff(attempts);
            debug!(delay_ms = delay.as_millis() as u64, "Backing off before retry");
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl StatusSink for Uploader {
    async fn upload(&self, payload: &UploadPayload) -> Result<UploadReceipt, ExportError> {
        Uploader::upload(self, payload).await
    }
}

fn header_name(name: &str) -> Result<HeaderName, ExportError> {
    HeaderName::from_bytes(name.as_bytes())
        .map_err(|e| ExportError::InvalidHeader(format!("{}: {}", name, e)))
}

fn header_value(value: &str) -> Result<HeaderValue, ExportError> {
    let mut value =
        HeaderValue::from_str(value).map_err(|e| ExportError::InvalidHeader(e.to_string()))?;
    value.set_sensitive(true);
    Ok(value)
}
