//! Inter-broker gossip messages.
//!
//! Gossip rides the same request-response transport as RPC. A payload is a
//! gossip message when its composite metadata carries a [`MIME_GOSSIP`]
//! entry; the data is the `MsgPack`-encoded [`GossipMessage`].

use bytes::Bytes;
use meshrpc_core::{BrokerInfo, CompositeMetadata, EventEnvelope, Payload};
use serde::{Deserialize, Serialize};

use crate::error::MeshResult;

pub const MIME_GOSSIP: &str = "message/x.meshrpc.gossip.v0";

/// A member as advertised inside gossip rounds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberDigest {
    pub id: String,
    pub uri: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PingPayload {
    pub from: BrokerInfo,
    /// Every member the sender considers active, itself excluded.
    pub members: Vec<MemberDigest>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeavePayload {
    pub id: String,
}

/// Top-level gossip message, internally tagged on `"type"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GossipMessage {
    Ping(PingPayload),
    /// Answer to `Ping`, same shape.
    Ack(PingPayload),
    FetchBrokerInfo,
    BrokerInfo(BrokerInfo),
    Leave(LeavePayload),
    ControlEvent(EventEnvelope),
}

impl GossipMessage {
    /// Wraps the message in a payload tagged as gossip.
    ///
    /// # Errors
    ///
    /// `Codec` on serialization failure.
    pub fn to_payload(&self) -> MeshResult<Payload> {
        let mut metadata = CompositeMetadata::new();
        metadata.push(MIME_GOSSIP, Bytes::new());
        let data = rmp_serde::to_vec_named(self)?;
        Ok(Payload::new(metadata.encode()?, data))
    }

    /// # Errors
    ///
    /// `Codec` if the data is not a gossip message.
    pub fn from_payload(payload: &Payload) -> MeshResult<Self> {
        Ok(rmp_serde::from_slice(&payload.data)?)
    }
}

/// Whether `metadata` marks a gossip payload.
#[must_use]
pub fn is_gossip(metadata: &CompositeMetadata) -> bool {
    metadata.get(MIME_GOSSIP).is_some()
}
