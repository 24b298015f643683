//! Membership domain types and configuration.

use std::time::Duration;

use meshrpc_core::BrokerInfo;
use serde::{Deserialize, Serialize};

/// Lifecycle of a broker as seen by this node.
///
/// `Joining -> Active -> Leaving | Failed`. The last two are terminal: the
/// member is dropped from the peer table as soon as it enters them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MemberState {
    Joining,
    Active,
    Leaving,
    Failed,
}

/// One known broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub info: BrokerInfo,
    pub state: MemberState,
    pub joined_at_ms: u64,
}

impl Member {
    #[must_use]
    pub fn id(&self) -> &str {
        &self.info.id
    }

    #[must_use]
    pub fn uri(&self) -> String {
        self.info.url()
    }
}

/// Why a member left the peer table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Departure {
    /// The member announced a graceful leave.
    Left,
    /// The failure detector gave up on it.
    Failed,
}

/// Emitted on every change to the peer table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipChange {
    MemberAdded(BrokerInfo),
    MemberRemoved { info: BrokerInfo, reason: Departure },
}

#[derive(Debug, Clone)]
pub struct MembershipConfig {
    /// Broker URIs contacted until they answer.
    pub seeds: Vec<String>,
    pub gossip_interval: Duration,
    /// Silence after which a peer counts as failed.
    pub failure_timeout: Duration,
    /// Bound on a single gossip exchange.
    pub request_timeout: Duration,
}

impl Default for MembershipConfig {
    fn default() -> Self {
        Self {
            seeds: Vec::new(),
            gossip_interval: Duration::from_secs(1),
            failure_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(1),
        }
    }
}
