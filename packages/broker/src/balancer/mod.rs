//! Load-balancing strategies.
//!
//! A balancer picks one candidate out of the current list for a call. All
//! per-hash state (round-robin counters, hash rings, latency statistics) lives
//! inside the balancer instance, so several brokers or upstream clusters in
//! one process never share it.

mod consistent_hash;
mod random;
mod round_robin;
mod weighted;

use std::sync::Arc;
use std::time::Duration;

pub use consistent_hash::{ConsistentHashBalancer, HashRing, VIRTUAL_NODES};
pub use random::RandomBalancer;
pub use round_robin::RoundRobinBalancer;
pub use weighted::{CandidateStats, WeightedStatsBalancer};

use crate::config::LoadBalanceStrategyKind;

/// Selection policy over a list of candidate keys (URIs or instance ids).
pub trait LoadBalancer: Send + Sync {
    fn kind(&self) -> LoadBalanceStrategyKind;

    /// Picks one candidate. Returns `None` only for an empty list; any
    /// fingerprint, including an empty or garbage one, is accepted.
    fn select<'a>(
        &self,
        routing_hash: u32,
        fingerprint: Option<&[u8]>,
        candidates: &'a [String],
    ) -> Option<&'a String>;

    /// A call to `candidate` is starting.
    fn on_start(&self, _candidate: &str) {}

    /// A call to `candidate` completed (or failed / timed out).
    fn record(&self, _candidate: &str, _latency: Duration, _success: bool) {}

    /// `candidate` left the pool for good.
    fn evict(&self, _candidate: &str) {}

    /// The candidate set behind `routing_hash` changed.
    fn invalidate(&self, _routing_hash: u32) {}
}

/// Builds the balancer named by `kind`.
///
/// `exploration` only applies to the weighted-stats strategy.
#[must_use]
pub fn build_balancer(kind: LoadBalanceStrategyKind, exploration: f64) -> Arc<dyn LoadBalancer> {
    match kind {
        LoadBalanceStrategyKind::RoundRobin => Arc::new(RoundRobinBalancer::new()),
        LoadBalanceStrategyKind::Random => Arc::new(RandomBalancer),
        LoadBalanceStrategyKind::ConsistentHash => Arc::new(ConsistentHashBalancer::new()),
        LoadBalanceStrategyKind::WeightedStats => {
            Arc::new(WeightedStatsBalancer::new(exploration))
        }
    }
}
