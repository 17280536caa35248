//! Property bus on top of a zenoh session.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, trace};
use zenoh::Session;
use zenoh::sample::SampleKind;

use pvsight_common::BusKeys;

use super::{BusError, PropertyBus, RawValue, Subscription, decode_item};

/// Property bus backed by zenoh.
///
/// - values live at `<root>/<service>/<path>` and are read with `get`
/// - changes are `put` on the same key
/// - services announce themselves with liveliness tokens
#[derive(Debug, Clone)]
pub struct ZenohBus {
    session: Arc<Session>,
    keys: BusKeys,
    query_timeout: Duration,
}

impl ZenohBus {
    /// Create a bus over an open session.
    pub fn new(session: Arc<Session>, keys: BusKeys, query_timeout: Duration) -> Self {
        Self {
            session,
            keys,
            query_timeout,
        }
    }

    /// Key expression builder in use.
    pub fn keys(&self) -> &BusKeys {
        &self.keys
    }
}

#[async_trait]
impl PropertyBus for ZenohBus {
    async fn list_names(&self) -> Result<Vec<String>, BusError> {
        let wildcard = self.keys.services_wildcard();
        let replies = self
            .session
            .liveliness()
            .get(&wildcard)
            .timeout(self.query_timeout)
            .await
            .map_err(|e| BusError::Unreachable(e.to_string()))?;

        let mut names: Vec<String> = Vec::new();
        while let Ok(reply) = replies.recv_async().await {
            match reply.result() {
                Ok(sample) => {
                    let key = sample.key_expr().as_str();
                    match self.keys.parse_service(key) {
                        Some(service) if !names.iter().any(|n| n == service) => {
                            names.push(service.to_string());
                        }
                        Some(_) => {}
                        None => trace!(key = %key, "Ignoring foreign liveliness token"),
                    }
                }
                Err(err) => debug!(error = ?err, "Liveliness query returned an error reply"),
            }
        }

        debug!(count = names.len(), "Listed live services");
        Ok(names)
    }

    async fn get_value(&self, service: &str, path: &str) -> Result<RawValue, BusError> {
        let key = self.keys.property(service, path);
        let replies = self
            .session
            .get(&key)
            .timeout(self.query_timeout)
            .await
            .map_err(|e| BusError::Unreachable(e.to_string()))?;

        while let Ok(reply) = replies.recv_async().await {
            match reply.result() {
                Ok(sample) => {
                    let bytes = sample.payload().to_bytes();
                    return decode_item(&key, &bytes);
                }
                Err(err) => debug!(key = %key, error = ?err, "Error reply to value query"),
            }
        }

        Err(BusError::NoReply { key })
    }

    async fn subscribe(&self, service: &str, path: &str) -> Result<Subscription, BusError> {
        let key = self.keys.property(service, path);
        let (tx, rx) = mpsc::unbounded_channel();

        let callback_key = key.clone();
        let subscriber = self
            .session
            .declare_subscriber(&key)
            .callback(move |sample| {
                if sample.kind() == SampleKind::Delete {
                    trace!(key = %callback_key, "Ignoring delete sample");
                    return;
                }

                let bytes = sample.payload().to_bytes();
                match decode_item(&callback_key, &bytes) {
                    Ok(value) => {
                        // Receiver gone means the tracker stopped; nothing to do.
                        let _ = tx.send(value);
                    }
                    Err(e) => debug!(error = %e, "Skipping undecodable notification"),
                }
            })
            .await
            .map_err(|e| BusError::Subscribe {
                key: key.clone(),
                message: e.to_string(),
            })?;

        debug!(key = %key, "Subscribed to property");
        Ok(Subscription::with_guard(rx, subscriber))
    }
}
