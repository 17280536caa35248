//! In-process property bus.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{BusError, PropertyBus, RawValue, Subscription};

type PropertyId = (String, String);

#[derive(Debug, Default)]
struct Inner {
    services: Vec<String>,
    values: HashMap<PropertyId, RawValue>,
    subscribers: HashMap<PropertyId, Vec<mpsc::UnboundedSender<RawValue>>>,
    unreachable: bool,
}

/// A property bus living entirely in memory.
///
/// Cloning yields another handle to the same bus.
///
/// # Example
///
/// ```
/// use pvsight_agent::bus::MemoryBus;
///
/// let bus = MemoryBus::new();
/// bus.add_service("com.victronenergy.system");
/// bus.set_value("com.victronenergy.system", "/Dc/Pv/Power", 512);
///
/// assert_eq!(bus.publish("com.victronenergy.system", "/Dc/Pv/Power", 640), 0);
/// ```
#[derive(Debug, Clone, Default)]
pub struct MemoryBus {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryBus {
    /// Create an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a live service. Registering twice is a no-op.
    pub fn add_service(&self, name: impl Into<String>) {
        let name = name.into();
        let mut inner = self.inner.lock();
        if !inner.services.contains(&name) {
            inner.services.push(name);
        }
    }

    /// Remove a service from enumeration. Its values and subscribers stay.
    pub fn remove_service(&self, name: &str) {
        self.inner.lock().services.retain(|s| s != name);
    }

    /// Set a property value without notifying subscribers.
    pub fn set_value(&self, service: &str, path: &str, value: impl Into<RawValue>) {
        self.inner
            .lock()
            .values
            .insert((service.to_string(), path.to_string()), value.into());
    }

    /// Set a property value and notify every subscriber of it.
    ///
    /// Returns the number of subscribers notified.
    pub fn publish(&self, service: &str, path: &str, value: impl Into<RawValue>) -> usize {
        let value = value.into();
        let id = (service.to_string(), path.to_string());
        let mut inner = self.inner.lock();

        inner.values.insert(id.clone(), value.clone());

        let Some(senders) = inner.subscribers.get_mut(&id) else {
            return 0;
        };
        senders.retain(|tx| tx.send(value.clone()).is_ok());
        senders.len()
    }

    /// Number of live subscriptions on a property.
    pub fn subscriber_count(&self, service: &str, path: &str) -> usize {
        self.inner
            .lock()
            .subscribers
            .get(&(service.to_string(), path.to_string()))
            .map(|senders| senders.iter().filter(|tx| !tx.is_closed()).count())
            .unwrap_or(0)
    }

    /// Make every operation fail with [`BusError::Unreachable`].
    pub fn set_unreachable(&self, unreachable: bool) {
        self.inner.lock().unreachable = unreachable;
    }

    fn check_reachable(inner: &Inner) -> Result<(), BusError> {
        if inner.unreachable {
            Err(BusError::Unreachable("memory bus offline".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl PropertyBus for MemoryBus {
    async fn list_names(&self) -> Result<Vec<String>, BusError> {
        let inner = self.inner.lock();
        Self::check_reachable(&inner)?;
        Ok(inner.services.clone())
    }

    async fn get_value(&self, service: &str, path: &str) -> Result<RawValue, BusError> {
        let inner = self.inner.lock();
        Self::check_reachable(&inner)?;
        inner
            .values
            .get(&(service.to_string(), path.to_string()))
            .cloned()
            .ok_or_else(|| BusError::NoReply {
                key: format!("{}{}", service, path),
            })
    }

    async fn subscribe(&self, service: &str, path: &str) -> Result<Subscription, BusError> {
        let mut inner = self.inner.lock();
        Self::check_reachable(&inner)?;

        let (tx, rx) = mpsc::unbounded_channel();
        inner
            .subscribers
            .entry((service.to_string(), path.to_string()))
            .or_default()
            .push(tx);
        Ok(Subscription::new(rx))
    }
}
