use rand::Rng;

use super::LoadBalancer;
use crate::config::LoadBalanceStrategyKind;

/// Uniform pick per call.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomBalancer;

impl LoadBalancer for RandomBalancer {
    fn kind(&self) -> LoadBalanceStrategyKind {
        LoadBalanceStrategyKind::Random
    }

    fn select<'a>(
        &self,
        _routing_hash: u32,
        _fingerprint: Option<&[u8]>,
        candidates: &'a [String],
    ) -> Option<&'a String> {
        match candidates.len() {
            0 => None,
            1 => candidates.first(),
            n => candidates.get(rand::rng().random_range(0..n)),
        }
    }
}
