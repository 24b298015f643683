use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use meshrpc_core::BrokerInfo;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::types::{Departure, Member, MemberState, MembershipChange};

/// Known peer brokers, keyed by broker id, plus tombstones for recently
/// departed ones.
#[derive(Default)]
pub struct PeerTable {
    members: DashMap<String, Member>,
    departed: DashMap<String, u64>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<MembershipChange>>>,
}

impl PeerTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe_changes(&self) -> mpsc::UnboundedReceiver<MembershipChange> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        rx
    }

    /// Adds or refreshes a member. Returns `true` if it was not known.
    pub fn upsert(&self, info: BrokerInfo, now_ms: u64) -> bool {
        self.departed.remove(&info.id);
        match self.members.entry(info.id.clone()) {
            Entry::Occupied(mut existing) => {
                existing.get_mut().info = info;
                return false;
            }
            Entry::Vacant(slot) => {
                slot.insert(Member {
                    info: info.clone(),
                    state: MemberState::Active,
                    joined_at_ms: now_ms,
                });
            }
        }
        self.update_gauge();
        self.notify(MembershipChange::MemberAdded(info));
        true
    }

    /// Drops a member and remembers the departure until `forget_departed`.
    pub fn remove(&self, id: &str, reason: Departure, now_ms: u64) -> Option<Member> {
        let (_, mut member) = self.members.remove(id)?;
        member.state = match reason {
            Departure::Left => MemberState::Leaving,
            Departure::Failed => MemberState::Failed,
        };
        self.departed.insert(id.to_string(), now_ms);
        self.update_gauge();
        self.notify(MembershipChange::MemberRemoved {
            info: member.info.clone(),
            reason,
        });
        Some(member)
    }

    /// Whether `id` departed less than `ttl_ms` ago.
    #[must_use]
    pub fn recently_departed(&self, id: &str, now_ms: u64, ttl_ms: u64) -> bool {
        self.departed
            .get(id)
            .is_some_and(|at| now_ms.saturating_sub(*at) < ttl_ms)
    }

    /// Expires tombstones older than `ttl_ms`.
    pub fn forget_departed(&self, now_ms: u64, ttl_ms: u64) {
        self.departed.retain(|_, at| now_ms.saturating_sub(*at) < ttl_ms);
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<Member> {
        self.members.get(id).map(|m| m.value().clone())
    }

    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.members.contains_key(id)
    }

    /// All members, sorted by id.
    #[must_use]
    pub fn members(&self) -> Vec<Member> {
        let mut members: Vec<Member> = self.members.iter().map(|m| m.value().clone()).collect();
        members.sort_by(|a, b| a.info.id.cmp(&b.info.id));
        members
    }

    /// Transport URIs of all members, sorted.
    #[must_use]
    pub fn uris(&self) -> Vec<String> {
        let mut uris: Vec<String> = self.members.iter().map(|m| m.uri()).collect();
        uris.sort();
        uris
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.members.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    #[allow(clippy::cast_precision_loss)]
    fn update_gauge(&self) {
        metrics::gauge!("meshrpc_gossip_members").set(self.members.len() as f64);
    }

    fn notify(&self, change: MembershipChange) {
        self.subscribers.lock().retain(|tx| tx.send(change.clone()).is_ok());
    }
}
