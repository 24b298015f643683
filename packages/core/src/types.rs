use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::locator::ServiceLocator;

/// A single call frame: routing metadata plus opaque data.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Payload {
    pub metadata: Bytes,
    pub data: Bytes,
}

impl Payload {
    #[must_use]
    pub fn new(metadata: impl Into<Bytes>, data: impl Into<Bytes>) -> Self {
        Self {
            metadata: metadata.into(),
            data: data.into(),
        }
    }

    /// A payload carrying only data.
    #[must_use]
    pub fn data(data: impl Into<Bytes>) -> Self {
        Self {
            metadata: Bytes::new(),
            data: data.into(),
        }
    }
}

/// Lifecycle of a connected provider.
///
/// `Connected -> Serving -> Down | Stopped`; `Down` may return to `Serving`.
/// `Stopped` is terminal and implies removal from the route table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum AppStatus {
    Connected = 0,
    Serving = 1,
    Down = 2,
    Stopped = 3,
}

impl AppStatus {
    /// Converts the `repr(u8)` discriminant back into a status.
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Connected),
            1 => Some(Self::Serving),
            2 => Some(Self::Down),
            3 => Some(Self::Stopped),
            _ => None,
        }
    }
}

/// Application identity a provider presents during the handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppMetadata {
    /// Process-unique instance id.
    pub instance_id: Uuid,
    /// Logical application name; several instances may share it.
    pub name: String,
    pub ip: String,
    /// Exposed ports keyed by transport schema (`"tcp"`, `"ws"`, ...).
    #[serde(default)]
    pub ports: BTreeMap<String, u16>,
    #[serde(default)]
    pub secure: bool,
    /// Relative weight hint; balancers that ignore weights ignore this.
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

fn default_weight() -> u32 {
    1
}

impl AppMetadata {
    /// Creates metadata with a fresh instance id and no ports or tags.
    #[must_use]
    pub fn new(name: impl Into<String>, ip: impl Into<String>) -> Self {
        Self {
            instance_id: Uuid::new_v4(),
            name: name.into(),
            ip: ip.into(),
            ports: BTreeMap::new(),
            secure: false,
            weight: default_weight(),
            tags: BTreeMap::new(),
        }
    }
}

/// Handshake frame sent by a provider when it connects to a broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupPayload {
    pub app: AppMetadata,
    /// Services to expose immediately; empty means "connect, expose later".
    #[serde(default)]
    pub services: Vec<ServiceLocator>,
}

impl SetupPayload {
    /// Serializes to `MsgPack` with named fields.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn encode(&self) -> Result<Vec<u8>, rmp_serde::encode::Error> {
        rmp_serde::to_vec_named(self)
    }

    /// Deserializes from `MsgPack`.
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes are not a valid setup frame.
    pub fn decode(bytes: &[u8]) -> Result<Self, rmp_serde::decode::Error> {
        rmp_serde::from_slice(bytes)
    }
}

/// One member of a broker cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerInfo {
    pub id: String,
    /// Transport schema used for inter-broker calls (`"tcp"`, `"local"`, ...).
    pub schema: String,
    pub ip: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub external_domain: Option<String>,
    pub port: u16,
    pub web_port: u16,
    pub start_time_ms: u64,
    /// `>= 1` means active.
    pub status: i32,
}

impl BrokerInfo {
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.status >= 1
    }

    /// Transport URI other brokers use to reach this one.
    #[must_use]
    pub fn url(&self) -> String {
        format!("{}://{}:{}", self.schema, self.ip, self.port)
    }

    /// Host clients should connect to, preferring the external alias.
    #[must_use]
    pub fn public_host(&self) -> &str {
        self.external_domain.as_deref().unwrap_or(&self.ip)
    }
}
