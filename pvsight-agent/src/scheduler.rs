//! Periodic export: aggregate, enrich, upload.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::aggregator::{Aggregator, Snapshot};
use crate::exporter::{ExportError, StatusSink, UploadPayload, UploadReceipt};
use crate::state::SharedState;
use crate::weather::WeatherClient;

/// Counters over the lifetime of a pipeline.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExportStats {
    pub ticks: u64,
    pub uploads_ok: u64,
    pub uploads_failed: u64,
    /// Ticks that never reached the uploader.
    pub ticks_skipped: u64,
    /// Requests beyond the first, summed over all uploads.
    pub retries: u64,
    pub weather_failures: u64,
}

/// Result of a single tick.
#[derive(Debug)]
pub enum TickOutcome {
    Uploaded(UploadReceipt),
    Skipped(ExportError),
    Failed(ExportError),
}

impl TickOutcome {
    pub fn is_uploaded(&self) -> bool {
        matches!(self, TickOutcome::Uploaded(_))
    }
}

/// One pass of aggregation and export.
pub struct ExportPipeline {
    state: SharedState,
    aggregator: Aggregator,
    weather: Option<WeatherClient>,
    sink: Box<dyn StatusSink>,
    stats: RwLock<ExportStats>,
}

impl ExportPipeline {
    pub fn new(
        state: SharedState,
        aggregator: Aggregator,
        weather: Option<WeatherClient>,
        sink: impl StatusSink + 'static,
    ) -> Self {
        Self {
            state,
            aggregator,
            weather,
            sink: Box::new(sink),
            stats: RwLock::new(ExportStats::default()),
        }
    }

    /// Run one tick at the current time.
    pub async fn run_once(&self) -> TickOutcome {
        self.run_at(Utc::now()).await
    }

    /// Run one tick stamped with `now`.
    ///
    /// Never fails: every error is logged and reported in the outcome.
    pub async fn run_at(&self, now: DateTime<Utc>) -> TickOutcome {
        self.stats.write().ticks += 1;

        let snapshot = {
            let store = self.state.read();
            self.aggregator.snapshot(&store, now)
        };
        let snapshot = match snapshot {
            Ok(snapshot) => snapshot,
            Err(e) => {
                error!(error = %e, "Skipping export");
                self.stats.write().ticks_skipped += 1;
                return TickOutcome::Skipped(e);
            }
        };

        let temperature = self.temperature().await;
        let snapshot = snapshot.with_temperature(temperature);
        log_snapshot(&snapshot);

        let payload = UploadPayload::from_snapshot(&snapshot);
        match self.sink.upload(&payload).await {
            Ok(receipt) => {
                let mut stats = self.stats.write();
                stats.uploads_ok += 1;
                stats.retries += u64::from(receipt.attempts.saturating_sub(1));
                drop(stats);

                info!(
                    status = receipt.status,
                    attempts = receipt.attempts,
                    "Uploaded status"
                );
                TickOutcome::Uploaded(receipt)
            }
            Err(e) => {
                let mut stats = self.stats.write();
                stats.uploads_failed += 1;
                stats.retries += u64::from(e.attempts().saturating_sub(1));
                drop(stats);

                error!(error = %e, attempts = e.attempts(), "Upload failed; dropping this tick");
                TickOutcome::Failed(e)
            }
        }
    }

    async fn temperature(&self) -> Option<f64> {
        let weather = self.weather.as_ref()?;
        match weather.fetch_temperature().await {
            Ok(temp) => Some(temp),
            Err(e) => {
                warn!(error = %e, "Weather lookup failed; omitting temperature");
                self.stats.write().weather_failures += 1;
                None
            }
        }
    }

    /// Current statistics.
    pub fn stats(&self) -> ExportStats {
        self.stats.read().clone()
    }
}

fn log_snapshot(snapshot: &Snapshot) {
    info!(
        eg = snapshot.generated_energy_kwh,
        ec = snapshot.consumed_energy_kwh,
        pg = snapshot.generated_power,
        pc = snapshot.consumed_power,
        vo = ?snapshot.ac_voltage,
        temp = ?snapshot.temperature,
        "Snapshot"
    );
}

/// Drives a pipeline on a fixed interval.
///
/// The first tick fires immediately. Ticks never overlap: a slow upload
/// pushes the next tick back.
pub struct Scheduler {
    pipeline: Arc<ExportPipeline>,
    interval: Duration,
}

impl Scheduler {
    pub fn new(pipeline: Arc<ExportPipeline>, interval: Duration) -> Self {
        Self { pipeline, interval }
    }

    pub fn pipeline(&self) -> Arc<ExportPipeline> {
        self.pipeline.clone()
    }

    /// Run forever.
    pub async fn run(self) {
        info!(interval_secs = self.interval.as_secs(), "Starting export schedule");

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            self.pipeline.run_once().await;
        }
    }
}
