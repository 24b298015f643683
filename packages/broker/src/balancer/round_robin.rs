use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

use super::LoadBalancer;
use crate::config::LoadBalanceStrategyKind;

/// Per-hash rotation.
///
/// Counters are never reset when the candidate list changes; the index is
/// always reduced modulo the current length, so a shrinking list can never
/// yield an out-of-range pick.
#[derive(Default)]
pub struct RoundRobinBalancer {
    counters: DashMap<u32, AtomicU64>,
}

impl RoundRobinBalancer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn next(&self, routing_hash: u32) -> u64 {
        if let Some(counter) = self.counters.get(&routing_hash) {
            return counter.fetch_add(1, Ordering::Relaxed);
        }
        self.counters
            .entry(routing_hash)
            .or_default()
            .fetch_add(1, Ordering::Relaxed)
    }
}

impl LoadBalancer for RoundRobinBalancer {
    fn kind(&self) -> LoadBalanceStrategyKind {
        LoadBalanceStrategyKind::RoundRobin
    }

    fn select<'a>(
        &self,
        routing_hash: u32,
        _fingerprint: Option<&[u8]>,
        candidates: &'a [String],
    ) -> Option<&'a String> {
        if candidates.is_empty() {
            return None;
        }
        let len = candidates.len() as u64;
        #[allow(clippy::cast_possible_truncation)]
        let index = (self.next(routing_hash) % len) as usize;
        candidates.get(index)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;

    use super::*;

    fn list(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("local://n{i}")).collect()
    }

    #[test]
    fn cycles_in_order_and_wraps() {
        let balancer = RoundRobinBalancer::new();
        let c = list(3);
        let picks: Vec<_> = (0..4).map(|_| balancer.select(9, None, &c).unwrap().clone()).collect();
        assert_eq!(picks, vec![c[0].clone(), c[1].clone(), c[2].clone(), c[0].clone()]);
    }

    #[test]
    fn each_candidate_once_per_round() {
        let balancer = RoundRobinBalancer::new();
        let c = list(7);
        balancer.select(1, None, &c);
        balancer.select(1, None, &c);
        let round: HashSet<_> = (0..7).map(|_| balancer.select(1, None, &c).unwrap()).collect();
        assert_eq!(round.len(), 7);
    }

    #[test]
    fn hashes_rotate_independently() {
        let balancer = RoundRobinBalancer::new();
        let c = list(3);
        assert_eq!(balancer.select(1, None, &c), Some(&c[0]));
        assert_eq!(balancer.select(1, None, &c), Some(&c[1]));
        assert_eq!(balancer.select(2, None, &c), Some(&c[0]));
    }

    #[test]
    fn shrinking_list_stays_in_range() {
        let balancer = RoundRobinBalancer::new();
        let big = list(5);
        for _ in 0..4 {
            balancer.select(3, None, &big);
        }
        let small = list(2);
        for _ in 0..10 {
            assert!(balancer.select(3, None, &small).is_some());
        }
    }

    #[test]
    fn concurrent_selection_is_fair() {
        let balancer = Arc::new(RoundRobinBalancer::new());
        let c = Arc::new(list(4));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let balancer = Arc::clone(&balancer);
                let c = Arc::clone(&c);
                std::thread::spawn(move || {
                    let mut counts = [0usize; 4];
                    for _ in 0..1000 {
                        let pick = balancer.select(5, None, &c).unwrap();
                        let idx = c.iter().position(|x| x == pick).unwrap();
                        counts[idx] += 1;
                    }
                    counts
                })
            })
            .collect();
        let mut totals = [0usize; 4];
        for handle in handles {
            for (total, n) in totals.iter_mut().zip(handle.join().unwrap()) {
                *total += n;
            }
        }
        assert_eq!(totals, [1000; 4]);
    }
}
