//! Control-plane events and their self-describing envelope.
//!
//! Every event travels as an [`EventEnvelope`]: a fully-qualified type
//! name, the source application id, a timestamp, and the `MsgPack`-encoded
//! payload. Receivers pick a decoder by the type name; the payload itself
//! never needs to be inspected by the transport or the gossip layer.

use std::collections::BTreeMap;
use std::time::SystemTime;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::locator::ServiceLocator;
use crate::types::AppStatus;

/// Errors from wrapping or unwrapping control events.
#[derive(Debug, thiserror::Error)]
pub enum EventError {
    #[error("failed to encode event: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    #[error("failed to decode event: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
    #[error("envelope carries {actual}, expected {expected}")]
    TypeMismatch {
        expected: &'static str,
        actual: String,
    },
}

/// A typed control event with a stable wire identifier.
pub trait ControlEvent: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Fully-qualified event type name used for dispatch.
    const EVENT_TYPE: &'static str;
}

/// Self-describing wire envelope for a control event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    /// Unique per publication; re-broadcasts keep the same id.
    pub id: Uuid,
    pub event_type: String,
    /// Identity of the application or broker that published the event.
    pub source: String,
    pub time_ms: u64,
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
}

impl EventEnvelope {
    /// Wraps a typed event.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::Encode`] if the payload cannot be serialized.
    pub fn wrap<E: ControlEvent>(source: impl Into<String>, event: &E) -> Result<Self, EventError> {
        Ok(Self {
            id: Uuid::new_v4(),
            event_type: E::EVENT_TYPE.to_string(),
            source: source.into(),
            time_ms: now_ms(),
            data: rmp_serde::to_vec_named(event)?,
        })
    }

    /// Returns `true` if this envelope carries events of type `E`.
    #[must_use]
    pub fn is<E: ControlEvent>(&self) -> bool {
        self.event_type == E::EVENT_TYPE
    }

    /// Decodes the payload as `E`.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::TypeMismatch`] if the type tag differs, or
    /// [`EventError::Decode`] if the payload is malformed.
    pub fn unwrap_as<E: ControlEvent>(&self) -> Result<E, EventError> {
        if !self.is::<E>() {
            return Err(EventError::TypeMismatch {
                expected: E::EVENT_TYPE,
                actual: self.event_type.clone(),
            });
        }
        Ok(rmp_serde::from_slice(&self.data)?)
    }

    /// Serializes the whole envelope to `MsgPack`.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::Encode`] on serialization failure.
    pub fn encode(&self) -> Result<Vec<u8>, EventError> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    /// Parses an envelope from `MsgPack`.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::Decode`] on malformed input.
    pub fn decode(bytes: &[u8]) -> Result<Self, EventError> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

fn now_ms() -> u64 {
    #[allow(clippy::cast_possible_truncation)]
    let ms = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64;
    ms
}

// ---------------------------------------------------------------------------
// Event types
// ---------------------------------------------------------------------------

/// A provider started serving the listed services.
///
/// `broker_uri` is set when the provider is connected to another broker;
/// receivers then route to it through that broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServicesExposed {
    pub instance_id: Uuid,
    pub app_name: String,
    pub services: Vec<ServiceLocator>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub broker_uri: Option<String>,
}

impl ControlEvent for ServicesExposed {
    const EVENT_TYPE: &'static str = "meshrpc.events.ServicesExposed";
}

/// A provider stopped serving the listed services (empty = all of them).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServicesHidden {
    pub instance_id: Uuid,
    pub app_name: String,
    #[serde(default)]
    pub services: Vec<ServiceLocator>,
}

impl ControlEvent for ServicesHidden {
    const EVENT_TYPE: &'static str = "meshrpc.events.ServicesHidden";
}

/// A provider's lifecycle status changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppStatusChanged {
    pub instance_id: Uuid,
    pub app_name: String,
    pub status: AppStatus,
}

impl ControlEvent for AppStatusChanged {
    const EVENT_TYPE: &'static str = "meshrpc.events.AppStatusChanged";
}

/// A configuration value changed for one application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigChanged {
    /// Application the change is addressed to.
    pub app_name: String,
    pub key: String,
    pub value: String,
}

impl ConfigChanged {
    /// Only the addressed application should apply the change.
    #[must_use]
    pub fn accepts(&self, local_app_name: &str) -> bool {
        self.app_name.eq_ignore_ascii_case(local_app_name)
    }
}

impl ControlEvent for ConfigChanged {
    const EVENT_TYPE: &'static str = "meshrpc.events.ConfigChanged";
}

/// A provider's exposed ports changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortsUpdated {
    pub instance_id: Uuid,
    pub ports: BTreeMap<String, u16>,
}

impl ControlEvent for PortsUpdated {
    const EVENT_TYPE: &'static str = "meshrpc.events.PortsUpdated";
}

/// The endpoint set behind a destination changed.
///
/// `destination` is a service GSV, or [`BROKER_DESTINATION`] for the broker tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamClusterChanged {
    pub destination: String,
    pub uris: Vec<String>,
}

impl ControlEvent for UpstreamClusterChanged {
    const EVENT_TYPE: &'static str = "meshrpc.events.UpstreamClusterChanged";
}

/// Logical destination name of the broker tier itself.
pub const BROKER_DESTINATION: &str = "meshrpc-broker";

/// Drop cached entries, optionally only for one application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheInvalidate {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub app_name: Option<String>,
    pub keys: Vec<String>,
}

impl ControlEvent for CacheInvalidate {
    const EVENT_TYPE: &'static str = "meshrpc.events.CacheInvalidate";
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exposed() -> ServicesExposed {
        ServicesExposed {
            instance_id: Uuid::new_v4(),
            app_name: "calc-app".to_string(),
            services: vec![ServiceLocator::of("g", "Calc", "1").unwrap()],
            broker_uri: None,
        }
    }

    #[test]
    fn envelope_carries_type_and_source() {
        let event = exposed();
        let envelope = EventEnvelope::wrap("broker-1", &event).unwrap();
        assert_eq!(envelope.event_type, "meshrpc.events.ServicesExposed");
        assert_eq!(envelope.source, "broker-1");
        assert!(envelope.is::<ServicesExposed>());
        assert!(!envelope.is::<ServicesHidden>());
        assert_eq!(envelope.unwrap_as::<ServicesExposed>().unwrap(), event);
    }

    #[test]
    fn unwrap_as_wrong_type_fails() {
        let envelope = EventEnvelope::wrap("b", &exposed()).unwrap();
        let err = envelope.unwrap_as::<ConfigChanged>().unwrap_err();
        assert!(matches!(err, EventError::TypeMismatch { .. }));
    }

    #[test]
    fn envelope_wire_round_trip_keeps_id() {
        let envelope = EventEnvelope::wrap("b", &exposed()).unwrap();
        let decoded = EventEnvelope::decode(&envelope.encode().unwrap()).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn malformed_envelope_fails_to_decode() {
        assert!(EventEnvelope::decode(&[0xc1, 0x00]).is_err());
    }

    #[test]
    fn config_changed_filters_by_app_name() {
        let event = ConfigChanged {
            app_name: "Calc-App".to_string(),
            key: "timeout".to_string(),
            value: "5s".to_string(),
        };
        assert!(event.accepts("calc-app"));
        assert!(!event.accepts("other-app"));
    }

    #[test]
    fn event_type_names_are_distinct() {
        let names = [
            ServicesExposed::EVENT_TYPE,
            ServicesHidden::EVENT_TYPE,
            AppStatusChanged::EVENT_TYPE,
            ConfigChanged::EVENT_TYPE,
            PortsUpdated::EVENT_TYPE,
            UpstreamClusterChanged::EVENT_TYPE,
            CacheInvalidate::EVENT_TYPE,
        ];
        let unique: std::collections::HashSet<_> = names.iter().collect();
        assert_eq!(unique.len(), names.len());
    }
}
