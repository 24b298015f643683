//! Control-event bus and the consumers that keep broker state in sync.
//!
//! Membership and the bus only meet through the two traits below: the bus
//! hands published envelopes to a [`Broadcaster`], and membership hands
//! received envelopes to a [`ControlEventSink`].

mod bus;
mod consumers;

use async_trait::async_trait;
use meshrpc_core::EventEnvelope;

pub use bus::EventBus;
pub use consumers::{install_consumers, ConsumerContext, LocalConfig};

/// Spreads an envelope to every peer. Delivery is best effort.
#[async_trait]
pub trait Broadcaster: Send + Sync {
    async fn broadcast(&self, envelope: &EventEnvelope);
}

/// Receives envelopes that arrived from peers.
#[async_trait]
pub trait ControlEventSink: Send + Sync {
    async fn deliver(&self, envelope: EventEnvelope);
}
