//! Property bus transport.
//!
//! The agent talks to devices through three primitives: enumerate live
//! services, read one property, and subscribe to changes of one property.
//! [`ZenohBus`] implements them on a zenoh session; [`MemoryBus`] is an
//! in-process bus used by tests and demos.

mod memory;
mod zenoh_bus;

use std::any::Any;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use pvsight_common::decode_auto;

pub use memory::MemoryBus;
pub use zenoh_bus::ZenohBus;

/// Untyped property value as carried on the bus.
pub type RawValue = serde_json::Value;

/// Errors raised by a bus transport.
#[derive(Debug, Error)]
pub enum BusError {
    /// The transport itself cannot be reached.
    #[error("Property bus unreachable: {0}")]
    Unreachable(String),

    /// Nobody answered a value query.
    #[error("No reply for {key}")]
    NoReply { key: String },

    /// A reply or notification could not be decoded.
    #[error("Malformed payload on {key}: {message}")]
    Payload { key: String, message: String },

    /// Declaring a subscription failed.
    #[error("Failed to subscribe to {key}: {message}")]
    Subscribe { key: String, message: String },
}

/// Wire shape of a property payload: `{"Value": <primitive>}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemPayload {
    #[serde(rename = "Value")]
    pub value: RawValue,
}

/// Decode a property payload (JSON or CBOR) into its raw value.
pub fn decode_item(key: &str, bytes: &[u8]) -> Result<RawValue, BusError> {
    decode_auto::<ItemPayload>(bytes)
        .map(|item| item.value)
        .map_err(|e| BusError::Payload {
            key: key.to_string(),
            message: e.to_string(),
        })
}

/// A live stream of change notifications for one property.
///
/// The transport-side registration stays declared for as long as this value
/// is alive.
pub struct Subscription {
    rx: mpsc::UnboundedReceiver<RawValue>,
    _guard: Option<Box<dyn Any + Send + Sync>>,
}

impl Subscription {
    /// Wrap a receiver with no transport resource attached.
    pub fn new(rx: mpsc::UnboundedReceiver<RawValue>) -> Self {
        Self { rx, _guard: None }
    }

    /// Wrap a receiver, keeping `guard` alive alongside it.
    pub fn with_guard<G>(rx: mpsc::UnboundedReceiver<RawValue>, guard: G) -> Self
    where
        G: Any + Send + Sync,
    {
        Self {
            rx,
            _guard: Some(Box::new(guard)),
        }
    }

    /// Wait for the next notification.
    ///
    /// Returns `None` once the transport has closed the stream.
    pub async fn recv(&mut self) -> Option<RawValue> {
        self.rx.recv().await
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("guarded", &self._guard.is_some())
            .finish()
    }
}

/// Request/response and publish/subscribe access to device properties.
#[async_trait]
pub trait PropertyBus: Send + Sync {
    /// Names of all currently live services, in transport order.
    async fn list_names(&self) -> Result<Vec<String>, BusError>;

    /// Read the current value of `path` on `service`.
    async fn get_value(&self, service: &str, path: &str) -> Result<RawValue, BusError>;

    /// Subscribe to changes of `path` on `service`.
    ///
    /// The subscription is active when this returns.
    async fn subscribe(&self, service: &str, path: &str) -> Result<Subscription, BusError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use pvsight_common::{Format, encode};

    #[test]
    fn test_decode_item_json() {
        let value = decode_item("k", br#"{"Value": 230.4}"#).unwrap();
        assert_eq!(value, serde_json::json!(230.4));
    }

    #[test]
    fn test_decode_item_cbor() {
        let bytes = encode(
            &ItemPayload {
                value: serde_json::json!(17),
            },
            Format::Cbor,
        )
        .unwrap();
        assert_eq!(decode_item("k", &bytes).unwrap(), serde_json::json!(17));
    }

    #[test]
    fn test_decode_item_without_value_field() {
        let err = decode_item("venus/x/Dc/Pv/Power", br#"{"Other": 1}"#).unwrap_err();
        assert!(matches!(err, BusError::Payload { key, .. } if key == "venus/x/Dc/Pv/Power"));
    }

    #[tokio::test]
    async fn test_subscription_ends_when_sender_dropped() {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut sub = Subscription::with_guard(rx, String::from("token"));

        tx.send(serde_json::json!(1)).unwrap();
        drop(tx);

        assert_eq!(sub.recv().await, Some(serde_json::json!(1)));
        assert_eq!(sub.recv().await, None);
    }
}
