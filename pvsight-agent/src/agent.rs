//! Agent startup: discovery, tracking and pipeline construction.

use std::sync::Arc;
use std::time::Duration;

use chrono_tz::Tz;
use tokio::task::JoinHandle;
use tracing::info;

use crate::aggregator::Aggregator;
use crate::bus::PropertyBus;
use crate::config::AgentConfig;
use crate::discovery::Topology;
use crate::error::{Result, StartupError};
use crate::exporter::Uploader;
use crate::scheduler::{ExportPipeline, Scheduler};
use crate::state::{SharedState, state_channel};
use crate::timezone::resolve_timezone;
use crate::tracker::Tracker;
use crate::weather::WeatherClient;

/// A started agent, ready to export.
///
/// Every tracked key holds its initial read by the time `start` returns.
pub struct Agent {
    topology: Topology,
    timezone: Tz,
    state: SharedState,
    tracker: Tracker,
    writer: JoinHandle<()>,
    pipeline: Arc<ExportPipeline>,
    interval: Duration,
}

impl Agent {
    /// Validate the configuration, then discover the installation and
    /// start tracking it.
    pub async fn start(bus: Arc<dyn PropertyBus>, config: &AgentConfig) -> Result<Self> {
        config.validate()?;

        let topology = Topology::discover(bus.as_ref()).await?;
        let timezone = resolve_timezone(config.timezone.as_deref(), bus.as_ref()).await;

        let (updates, writer) = state_channel();
        let state = writer.state();
        let writer = tokio::spawn(writer.run());

        let mut tracker = Tracker::new(bus, updates.clone());
        let tracked = tracker.track_all(topology.tracked_metrics()).await?;
        updates.flush().await?;
        info!(count = tracked, "Tracking properties");

        let uploader =
            Uploader::new(&config.pvoutput).map_err(|e| StartupError::Client(e.to_string()))?;
        let weather = WeatherClient::from_config(&config.weather)
            .map_err(|e| StartupError::Client(e.to_string()))?;
        if weather.is_some() {
            info!(city_id = %config.weather.city_id, "Weather enrichment enabled");
        }

        let pipeline = Arc::new(ExportPipeline::new(
            state.clone(),
            Aggregator::new(timezone),
            weather,
            uploader,
        ));

        Ok(Self {
            topology,
            timezone,
            state,
            tracker,
            writer,
            pipeline,
            interval: config.pvoutput.interval(),
        })
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    /// Read handle on the state store.
    pub fn state(&self) -> SharedState {
        self.state.clone()
    }

    pub fn pipeline(&self) -> Arc<ExportPipeline> {
        self.pipeline.clone()
    }

    /// Scheduler running this agent's pipeline at the configured interval.
    pub fn scheduler(&self) -> Scheduler {
        Scheduler::new(self.pipeline.clone(), self.interval)
    }

    /// Stop tracking and the state writer.
    pub fn shutdown(mut self) {
        self.tracker.shutdown();
        self.writer.abort();
    }
}
