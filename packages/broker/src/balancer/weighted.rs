use std::time::Duration;

use dashmap::DashMap;
use rand::Rng;

use super::LoadBalancer;
use crate::config::LoadBalanceStrategyKind;

/// Smoothing factor for latency and failure averages.
const ALPHA: f64 = 0.3;
/// Cost multiplier applied at a 100% failure rate.
const FAILURE_PENALTY: f64 = 10.0;
/// Latency assumed for unmeasured candidates when nothing is measured yet.
const DEFAULT_PRIOR_MS: f64 = 1.0;

/// Running statistics for one candidate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CandidateStats {
    pub ewma_latency_ms: f64,
    pub failure_rate: f64,
    pub outstanding: u32,
    pub samples: u64,
}

impl CandidateStats {
    /// Predicted response time of one more call.
    #[must_use]
    pub fn cost(&self) -> f64 {
        self.ewma_latency_ms.max(0.001)
            * f64::from(self.outstanding + 1)
            * (1.0 + FAILURE_PENALTY * self.failure_rate)
    }
}

impl Default for CandidateStats {
    fn default() -> Self {
        Self {
            ewma_latency_ms: 0.0,
            failure_rate: 0.0,
            outstanding: 0,
            samples: 0,
        }
    }
}

/// Lowest-predicted-latency selection with an exploration floor.
///
/// With probability `exploration` a uniformly random candidate is picked,
/// so every candidate keeps at least `exploration / n` of the traffic and
/// stale statistics of a slow instance still get refreshed. An idle
/// candidate without any completed sample is preferred over measured ones.
/// Once it has calls in flight it is priced at the mean latency of the
/// measured candidates, so a burst spreads instead of piling onto it.
pub struct WeightedStatsBalancer {
    exploration: f64,
    stats: DashMap<String, CandidateStats>,
}

impl WeightedStatsBalancer {
    #[must_use]
    pub fn new(exploration: f64) -> Self {
        Self {
            exploration: exploration.clamp(0.0, 1.0),
            stats: DashMap::new(),
        }
    }

    #[must_use]
    pub fn exploration(&self) -> f64 {
        self.exploration
    }

    #[must_use]
    pub fn stats(&self, candidate: &str) -> Option<CandidateStats> {
        self.stats.get(candidate).map(|s| *s)
    }

    /// Mean smoothed latency of the measured candidates.
    fn prior_latency_ms(&self, candidates: &[String]) -> f64 {
        let (sum, n) = candidates
            .iter()
            .filter_map(|c| self.stats(c))
            .filter(|s| s.samples > 0)
            .fold((0.0, 0u32), |(sum, n), s| (sum + s.ewma_latency_ms, n + 1));
        if n == 0 {
            DEFAULT_PRIOR_MS
        } else {
            sum / f64::from(n)
        }
    }
}

impl Default for WeightedStatsBalancer {
    fn default() -> Self {
        Self::new(0.1)
    }
}

impl LoadBalancer for WeightedStatsBalancer {
    fn kind(&self) -> LoadBalanceStrategyKind {
        LoadBalanceStrategyKind::WeightedStats
    }

    fn select<'a>(
        &self,
        _routing_hash: u32,
        _fingerprint: Option<&[u8]>,
        candidates: &'a [String],
    ) -> Option<&'a String> {
        if candidates.len() <= 1 {
            return candidates.first();
        }
        let mut rng = rand::rng();
        if rng.random::<f64>() < self.exploration {
            return candidates.get(rng.random_range(0..candidates.len()));
        }

        let prior = self.prior_latency_ms(candidates);
        let mut best: Option<(&'a String, f64)> = None;
        for candidate in candidates {
            let stats = self.stats(candidate).unwrap_or_default();
            let cost = match (stats.samples, stats.outstanding) {
                (0, 0) => return Some(candidate),
                (0, _) => CandidateStats {
                    ewma_latency_ms: prior,
                    ..stats
                }
                .cost(),
                _ => stats.cost(),
            };
            if best.is_none_or(|(_, b)| cost < b) {
                best = Some((candidate, cost));
            }
        }
        best.map(|(candidate, _)| candidate)
    }

    fn on_start(&self, candidate: &str) {
        self.stats.entry(candidate.to_string()).or_default().outstanding += 1;
    }

    fn record(&self, candidate: &str, latency: Duration, success: bool) {
        let mut entry = self.stats.entry(candidate.to_string()).or_default();
        let stats = entry.value_mut();
        let latency_ms = latency.as_secs_f64() * 1000.0;
        let failed = if success { 0.0 } else { 1.0 };
        if stats.samples == 0 {
            stats.ewma_latency_ms = latency_ms;
            stats.failure_rate = failed;
        } else {
            stats.ewma_latency_ms += ALPHA * (latency_ms - stats.ewma_latency_ms);
            stats.failure_rate += ALPHA * (failed - stats.failure_rate);
        }
        stats.samples += 1;
        stats.outstanding = stats.outstanding.saturating_sub(1);
    }

    fn evict(&self, candidate: &str) {
        self.stats.remove(candidate);
    }
}
