use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Arc;

use dashmap::DashMap;
use meshrpc_core::murmur3_32;

use super::{LoadBalancer, RoundRobinBalancer};
use crate::config::LoadBalanceStrategyKind;

/// Virtual nodes placed on the ring per candidate.
pub const VIRTUAL_NODES: usize = 128;

const RING_SEED: u32 = 0x9747_b28c;

/// Immutable ring over one candidate list.
///
/// Built wholesale for a given list and never modified; a changed list gets a
/// new ring.
#[derive(Debug)]
pub struct HashRing {
    signature: u64,
    len: usize,
    /// `(point, candidate index)`, sorted by point.
    points: Vec<(u32, usize)>,
}

impl HashRing {
    #[must_use]
    pub fn build(candidates: &[String]) -> Self {
        let mut points = Vec::with_capacity(candidates.len() * VIRTUAL_NODES);
        for (index, candidate) in candidates.iter().enumerate() {
            for replica in 0..VIRTUAL_NODES {
                let key = format!("{candidate}#{replica}");
                points.push((murmur3_32(key.as_bytes(), RING_SEED), index));
            }
        }
        points.sort_unstable();
        Self {
            signature: signature(candidates),
            len: candidates.len(),
            points,
        }
    }

    /// Whether this ring was built for exactly `candidates`.
    #[must_use]
    pub fn matches(&self, candidates: &[String]) -> bool {
        self.len == candidates.len() && self.signature == signature(candidates)
    }

    /// Index of the candidate owning `fingerprint`.
    #[must_use]
    pub fn locate(&self, fingerprint: &[u8]) -> Option<usize> {
        let h = murmur3_32(fingerprint, RING_SEED);
        let at = self.points.partition_point(|(point, _)| *point < h);
        self.points
            .get(at)
            .or_else(|| self.points.first())
            .map(|(_, index)| *index)
    }
}

fn signature(candidates: &[String]) -> u64 {
    let mut hasher = DefaultHasher::new();
    candidates.hash(&mut hasher);
    hasher.finish()
}

/// Fingerprint-affine selection.
///
/// Calls without a fingerprint (or with an empty one) fall back to
/// round-robin.
#[derive(Default)]
pub struct ConsistentHashBalancer {
    rings: DashMap<u32, Arc<HashRing>>,
    fallback: RoundRobinBalancer,
}

impl ConsistentHashBalancer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn ring_for(&self, routing_hash: u32, candidates: &[String]) -> Arc<HashRing> {
        if let Some(ring) = self.rings.get(&routing_hash) {
            if ring.matches(candidates) {
                return Arc::clone(ring.value());
            }
        }
        let ring = Arc::new(HashRing::build(candidates));
        tracing::debug!(routing_hash, candidates = candidates.len(), "hash ring rebuilt");
        self.rings.insert(routing_hash, Arc::clone(&ring));
        ring
    }
}

impl LoadBalancer for ConsistentHashBalancer {
    fn kind(&self) -> LoadBalanceStrategyKind {
        LoadBalanceStrategyKind::ConsistentHash
    }

    fn select<'a>(
        &self,
        routing_hash: u32,
        fingerprint: Option<&[u8]>,
        candidates: &'a [String],
    ) -> Option<&'a String> {
        if candidates.is_empty() {
            return None;
        }
        let Some(fp) = fingerprint.filter(|fp| !fp.is_empty()) else {
            return self.fallback.select(routing_hash, None, candidates);
        };
        let ring = self.ring_for(routing_hash, candidates);
        ring.locate(fp).and_then(|index| candidates.get(index))
    }

    fn invalidate(&self, routing_hash: u32) {
        self.rings.remove(&routing_hash);
    }
}
