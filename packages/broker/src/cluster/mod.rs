//! Broker cluster membership: gossip, failure detection, and the peer table.

pub mod failure_detector;
mod membership;
mod messages;
mod peers;
mod types;

pub use failure_detector::{DeadlineDetector, FailureDetector, PhiAccrualDetector, PhiAccrualSettings};
pub use membership::{GossipCommand, GossipMembership, GossipTicker};
pub use messages::{is_gossip, GossipMessage, LeavePayload, MemberDigest, PingPayload, MIME_GOSSIP};
pub use peers::PeerTable;
pub use types::{Departure, Member, MemberState, MembershipChange, MembershipConfig};
