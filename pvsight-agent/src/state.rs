//! Shared state store and its single-writer update queue.
//!
//! Trackers never mutate the store directly. They send [`StateUpdate`]s
//! through a [`StateSender`]; one [`StateWriter`] task applies them in
//! arrival order. Readers take a shared lock on [`SharedState`].

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::{RwLock, RwLockReadGuard};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

use crate::bus::RawValue;

/// Capacity of the update queue.
pub const UPDATE_QUEUE_CAPACITY: usize = 1024;

/// A normalized property reading.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum Reading {
    /// Integer-typed property value.
    Integer(i64),
    /// Floating-point property value.
    Float(f64),
    /// No usable value: never read, or of an unrecognized type.
    #[default]
    Unset,
}

impl Reading {
    /// Normalize a raw bus value.
    ///
    /// Integers that fit in an `i64` stay integers, other numbers become
    /// floats, and everything else (strings, arrays, null, ...) is `Unset`.
    pub fn from_raw(raw: &RawValue) -> Self {
        match raw {
            RawValue::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Reading::Integer(i)
                } else if let Some(f) = n.as_f64() {
                    Reading::Float(f)
                } else {
                    Reading::Unset
                }
            }
            _ => Reading::Unset,
        }
    }

    /// Numeric value, if any.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Reading::Integer(i) => Some(*i as f64),
            Reading::Float(f) => Some(*f),
            Reading::Unset => None,
        }
    }

    pub fn is_unset(&self) -> bool {
        matches!(self, Reading::Unset)
    }
}

impl fmt::Display for Reading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reading::Integer(i) => write!(f, "{}", i),
            Reading::Float(v) => write!(f, "{}", v),
            Reading::Unset => write!(f, "unset"),
        }
    }
}

/// How the aggregator treats a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricGroup {
    /// Summed into the generated energy total.
    GeneratedEnergy,
    /// Summed into the consumed energy total.
    ConsumedEnergy,
    /// Read on its own.
    Scalar,
}

/// Logical key of a tracked metric.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MetricKey {
    /// Solar charger user yield, per charger service.
    SolarYield(String),
    /// Grid meter forward energy, per meter service.
    GridImport(String),
    /// Inverter energy from battery to AC out.
    InverterToAcOut,
    /// Inverter energy from battery to AC in.
    InverterToAcIn,
    /// Instantaneous PV power.
    GeneratedPower,
    /// Instantaneous AC consumption.
    ConsumedPower,
    /// Inverter AC output voltage.
    AcOutVoltage,
}

impl MetricKey {
    pub fn group(&self) -> MetricGroup {
        match self {
            MetricKey::SolarYield(_) => MetricGroup::GeneratedEnergy,
            MetricKey::GridImport(_) | MetricKey::InverterToAcOut | MetricKey::InverterToAcIn => {
                MetricGroup::ConsumedEnergy
            }
            MetricKey::GeneratedPower | MetricKey::ConsumedPower | MetricKey::AcOutVoltage => {
                MetricGroup::Scalar
            }
        }
    }
}

impl fmt::Display for MetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricKey::SolarYield(service) => write!(f, "yield:{}", service),
            MetricKey::GridImport(service) => write!(f, "grid:{}", service),
            MetricKey::InverterToAcOut => write!(f, "c1"),
            MetricKey::InverterToAcIn => write!(f, "c2"),
            MetricKey::GeneratedPower => write!(f, "pg"),
            MetricKey::ConsumedPower => write!(f, "pc"),
            MetricKey::AcOutVoltage => write!(f, "vo"),
        }
    }
}

/// Lifecycle of a tracked metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackState {
    /// Registered, nothing written yet.
    Uninitialized,
    /// Holds the initial read.
    Initialized,
    /// Overwritten by at least one notification.
    Updated,
}

/// One store entry.
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    pub reading: Reading,
    pub state: TrackState,
    /// Number of writes applied.
    pub writes: u64,
}

impl Default for Entry {
    fn default() -> Self {
        Self {
            reading: Reading::Unset,
            state: TrackState::Uninitialized,
            writes: 0,
        }
    }
}

/// Mapping from logical key to its latest reading.
#[derive(Debug, Default)]
pub struct StateStore {
    entries: BTreeMap<MetricKey, Entry>,
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a key as `Uninitialized`. Existing entries are untouched.
    pub fn register(&mut self, key: MetricKey) {
        self.entries.entry(key).or_default();
    }

    /// Overwrite the reading of a key, registering it if needed.
    ///
    /// Returns the state the entry moved to.
    pub fn set(&mut self, key: MetricKey, reading: Reading) -> TrackState {
        let entry = self.entries.entry(key).or_default();
        entry.state = match entry.state {
            TrackState::Uninitialized => TrackState::Initialized,
            TrackState::Initialized | TrackState::Updated => TrackState::Updated,
        };
        entry.reading = reading;
        entry.writes += 1;
        entry.state
    }

    /// Current reading; `Unset` for unknown keys.
    pub fn get(&self, key: &MetricKey) -> Reading {
        self.entries
            .get(key)
            .map(|e| e.reading)
            .unwrap_or(Reading::Unset)
    }

    pub fn entry(&self, key: &MetricKey) -> Option<&Entry> {
        self.entries.get(key)
    }

    pub fn is_registered(&self, key: &MetricKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Sum of every present reading in a group. Unset members contribute
    /// nothing; an empty or all-unset group sums to 0.
    ///
    /// Members are added in key order, so equal readings always give a
    /// bit-identical total.
    pub fn sum(&self, group: MetricGroup) -> f64 {
        self.entries
            .iter()
            .filter(|(key, _)| key.group() == group)
            .filter_map(|(_, entry)| entry.reading.as_f64())
            .sum()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Read handle on the shared store.
#[derive(Debug, Clone, Default)]
pub struct SharedState {
    inner: Arc<RwLock<StateStore>>,
}

impl SharedState {
    /// Take a read lock. Do not hold it across an `.await`.
    pub fn read(&self) -> RwLockReadGuard<'_, StateStore> {
        self.inner.read()
    }
}

/// Messages accepted by the [`StateWriter`].
#[derive(Debug)]
pub enum StateUpdate {
    /// Register a key ahead of its first value.
    Register(MetricKey),
    /// Overwrite a key.
    Set { key: MetricKey, reading: Reading },
    /// Acknowledge once everything queued before it is applied.
    Flush(oneshot::Sender<()>),
}

/// The writer task is gone.
#[derive(Debug, Error)]
#[error("State writer has stopped")]
pub struct WriterClosed;

/// Producer side of the update queue.
#[derive(Debug, Clone)]
pub struct StateSender {
    tx: mpsc::Sender<StateUpdate>,
}

impl StateSender {
    pub async fn register(&self, key: MetricKey) -> Result<(), WriterClosed> {
        self.send(StateUpdate::Register(key)).await
    }

    pub async fn set(&self, key: MetricKey, reading: Reading) -> Result<(), WriterClosed> {
        self.send(StateUpdate::Set { key, reading }).await
    }

    /// Wait until every update sent before this call has been applied.
    pub async fn flush(&self) -> Result<(), WriterClosed> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.send(StateUpdate::Flush(ack_tx)).await?;
        ack_rx.await.map_err(|_| WriterClosed)
    }

    async fn send(&self, update: StateUpdate) -> Result<(), WriterClosed> {
        self.tx.send(update).await.map_err(|_| WriterClosed)
    }
}

/// Sole owner of the write path into the store.
#[derive(Debug)]
pub struct StateWriter {
    state: SharedState,
    rx: mpsc::Receiver<StateUpdate>,
}

impl StateWriter {
    /// Read handle on the store this writer maintains.
    pub fn state(&self) -> SharedState {
        self.state.clone()
    }

    /// Apply updates until every sender is dropped.
    pub async fn run(mut self) {
        while let Some(update) = self.rx.recv().await {
            self.apply(update);
        }
        debug!("State writer stopped");
    }

    fn apply(&self, update: StateUpdate) {
        match update {
            StateUpdate::Register(key) => {
                trace!(key = %key, "Registering metric");
                self.state.inner.write().register(key);
            }
            StateUpdate::Set { key, reading } => {
                let state = {
                    let mut store = self.state.inner.write();
                    store.set(key.clone(), reading)
                };
                trace!(key = %key, reading = %reading, state = ?state, "Applied reading");
            }
            StateUpdate::Flush(ack) => {
                let _ = ack.send(());
            }
        }
    }
}

/// Create the update queue and its writer.
pub fn state_channel() -> (StateSender, StateWriter) {
    let (tx, rx) = mpsc::channel(UPDATE_QUEUE_CAPACITY);
    let writer = StateWriter {
        state: SharedState::default(),
        rx,
    };
    (StateSender { tx }, writer)
}
