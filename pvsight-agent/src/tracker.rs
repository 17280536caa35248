//! Property tracking: initial read plus live change notifications.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::bus::PropertyBus;
use crate::discovery::Endpoint;
use crate::error::{Result, StartupError};
use crate::state::{MetricKey, Reading, StateSender};

/// Binding of one bus property to one logical key.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackedMetric {
    pub endpoint: Endpoint,
    pub path: String,
    pub key: MetricKey,
}

impl TrackedMetric {
    pub fn new(endpoint: Endpoint, path: impl Into<String>, key: MetricKey) -> Self {
        Self {
            endpoint,
            path: path.into(),
            key,
        }
    }
}

/// Keeps tracked properties flowing into the state store.
///
/// Each tracked metric owns a forwarding task that lives until the
/// subscription closes or the tracker is shut down.
pub struct Tracker {
    bus: Arc<dyn PropertyBus>,
    updates: StateSender,
    tasks: Vec<JoinHandle<()>>,
}

impl Tracker {
    pub fn new(bus: Arc<dyn PropertyBus>, updates: StateSender) -> Self {
        Self {
            bus,
            updates,
            tasks: Vec::new(),
        }
    }

    /// Start tracking one property.
    ///
    /// The subscription is declared before the initial read, so a change
    /// landing during the read is queued and applied after it. A failed
    /// initial read leaves the key unset; a failed subscription is fatal.
    pub async fn track(&mut self, metric: TrackedMetric) -> Result<()> {
        let TrackedMetric {
            endpoint,
            path,
            key,
        } = metric;

        self.updates.register(key.clone()).await?;

        let mut subscription = self
            .bus
            .subscribe(&endpoint.name, &path)
            .await
            .map_err(|source| StartupError::Subscribe {
                key: format!("{}{}", endpoint.name, path),
                source,
            })?;

        match self.bus.get_value(&endpoint.name, &path).await {
            Ok(raw) => {
                let reading = Reading::from_raw(&raw);
                if reading.is_unset() {
                    debug!(endpoint = %endpoint, path = %path, raw = %raw, "Unrecognized value type");
                }
                self.updates.set(key.clone(), reading).await?;
            }
            Err(e) => {
                warn!(endpoint = %endpoint, path = %path, error = %e, "Initial read failed; waiting for notifications");
            }
        }

        let updates = self.updates.clone();
        let task = tokio::spawn(async move {
            while let Some(raw) = subscription.recv().await {
                if updates.set(key.clone(), Reading::from_raw(&raw)).await.is_err() {
                    break;
                }
            }
            debug!(endpoint = %endpoint, path = %path, "Stopped tracking");
        });
        self.tasks.push(task);

        Ok(())
    }

    /// Track every metric in order. Returns how many were tracked.
    pub async fn track_all(
        &mut self,
        metrics: impl IntoIterator<Item = TrackedMetric>,
    ) -> Result<usize> {
        let mut count = 0;
        for metric in metrics {
            self.track(metric).await?;
            count += 1;
        }
        Ok(count)
    }

    /// Number of live forwarding tasks.
    pub fn len(&self) -> usize {
        self.tasks.iter().filter(|t| !t.is_finished()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop every forwarding task.
    pub fn shutdown(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for Tracker {
    fn drop(&mut self) {
        self.shutdown();
    }
}
