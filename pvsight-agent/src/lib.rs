//! PVSight energy telemetry agent.
//!
//! Discovers solar chargers, grid meters and the inverter on the property
//! bus, keeps their counters in a shared state store, and uploads a
//! snapshot to the metrics collector on a fixed interval.
//!
//! # Data flow
//!
//! ```text
//! PropertyBus ──subscribe/get──► Tracker ──StateUpdate──► StateWriter
//!                                                             │
//!                                                        SharedState
//!                                                             │
//! Scheduler ──tick──► Aggregator ──► WeatherClient ──► Uploader ──► HTTP
//! ```

pub mod agent;
pub mod aggregator;
pub mod bus;
pub mod config;
pub mod discovery;
pub mod error;
pub mod exporter;
pub mod retry;
pub mod scheduler;
pub mod state;
pub mod timezone;
pub mod tracker;
pub mod weather;

pub use agent::Agent;
pub use bus::{BusError, MemoryBus, PropertyBus, ZenohBus};
pub use config::AgentConfig;
pub use error::StartupError;
pub use scheduler::{ExportPipeline, ExportStats, Scheduler, TickOutcome};
