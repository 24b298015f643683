//! Heartbeat-based peer failure detection.
//!
//! Two detectors share the [`FailureDetector`] trait:
//! - [`PhiAccrualDetector`] scores silence against the observed distribution
//!   of gossip intervals (Hayashibara et al., 2004; logistic CDF approximation).
//! - [`DeadlineDetector`] declares a peer failed after a fixed silence.

use std::collections::{HashMap, VecDeque};

use parking_lot::RwLock;

/// Decides whether a peer is still alive from its heartbeat history.
pub trait FailureDetector: Send + Sync {
    /// Records a heartbeat from `peer` at `now_ms`.
    fn heartbeat(&self, peer: &str, now_ms: u64);

    /// Suspicion level; `0.0` for unknown peers.
    fn phi(&self, peer: &str, now_ms: u64) -> f64;

    fn is_available(&self, peer: &str, now_ms: u64) -> bool;

    /// Drops all history for `peer`.
    fn forget(&self, peer: &str);
}

// ---------------------------------------------------------------------------
// Phi accrual
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PhiAccrualSettings {
    pub threshold: f64,
    pub window: usize,
    pub min_std_dev_ms: f64,
    /// Silence that always counts as failure, regardless of history.
    pub acceptable_pause_ms: u64,
    /// Interval assumed before enough samples exist.
    pub first_interval_ms: u64,
}

impl Default for PhiAccrualSettings {
    fn default() -> Self {
        Self {
            threshold: 8.0,
            window: 100,
            min_std_dev_ms: 100.0,
            acceptable_pause_ms: 5000,
            first_interval_ms: 1000,
        }
    }
}

struct History {
    last_ms: u64,
    intervals: VecDeque<u64>,
    sum: u64,
    sum_sq: f64,
}

impl History {
    fn new(now_ms: u64) -> Self {
        Self {
            last_ms: now_ms,
            intervals: VecDeque::new(),
            sum: 0,
            sum_sq: 0.0,
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn record(&mut self, now_ms: u64, window: usize) {
        let interval = now_ms.saturating_sub(self.last_ms);
        self.last_ms = now_ms.max(self.last_ms);
        if self.intervals.len() >= window {
            if let Some(old) = self.intervals.pop_front() {
                self.sum -= old;
                self.sum_sq -= (old as f64).powi(2);
            }
        }
        self.intervals.push_back(interval);
        self.sum += interval;
        self.sum_sq += (interval as f64).powi(2);
    }

    #[allow(clippy::cast_precision_loss)]
    fn mean_and_std(&self, settings: &PhiAccrualSettings) -> (f64, f64) {
        if self.intervals.len() < 2 {
            let first = settings.first_interval_ms as f64;
            return (first, (first / 4.0).max(settings.min_std_dev_ms));
        }
        let n = self.intervals.len() as f64;
        let mean = self.sum as f64 / n;
        let variance = (self.sum_sq / n - mean * mean).max(0.0);
        (mean, variance.sqrt().max(settings.min_std_dev_ms))
    }
}

pub struct PhiAccrualDetector {
    settings: PhiAccrualSettings,
    peers: RwLock<HashMap<String, History>>,
}

impl PhiAccrualDetector {
    #[must_use]
    pub fn new(settings: PhiAccrualSettings) -> Self {
        Self {
            settings,
            peers: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for PhiAccrualDetector {
    fn default() -> Self {
        Self::new(PhiAccrualSettings::default())
    }
}

impl FailureDetector for PhiAccrualDetector {
    fn heartbeat(&self, peer: &str, now_ms: u64) {
        let mut peers = self.peers.write();
        match peers.get_mut(peer) {
            Some(history) => history.record(now_ms, self.settings.window),
            None => {
                peers.insert(peer.to_string(), History::new(now_ms));
            }
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn phi(&self, peer: &str, now_ms: u64) -> f64 {
        let peers = self.peers.read();
        let Some(history) = peers.get(peer) else {
            return 0.0;
        };
        let silence = now_ms.saturating_sub(history.last_ms);
        if silence > self.settings.acceptable_pause_ms {
            return f64::INFINITY;
        }
        let (mean, std_dev) = history.mean_and_std(&self.settings);
        logistic_phi(silence as f64, mean, std_dev)
    }

    fn is_available(&self, peer: &str, now_ms: u64) -> bool {
        self.phi(peer, now_ms) < self.settings.threshold
    }

    fn forget(&self, peer: &str) {
        self.peers.write().remove(peer);
    }
}

/// `-log10(P(interval > silence))` with the normal CDF approximated by a
/// logistic curve.
fn logistic_phi(silence: f64, mean: f64, std_dev: f64) -> f64 {
    let y = (silence - mean) / std_dev;
    let e = (-y * (1.5976 + 0.070_566 * y * y)).exp();
    let p_later = if silence > mean {
        e / (1.0 + e)
    } else {
        1.0 - 1.0 / (1.0 + e)
    };
    -(p_later.max(f64::MIN_POSITIVE)).log10()
}

// ---------------------------------------------------------------------------
// Deadline
// ---------------------------------------------------------------------------

pub struct DeadlineDetector {
    timeout_ms: u64,
    last_seen: RwLock<HashMap<String, u64>>,
}

impl DeadlineDetector {
    #[must_use]
    pub fn new(timeout_ms: u64) -> Self {
        Self {
            timeout_ms: timeout_ms.max(1),
            last_seen: RwLock::new(HashMap::new()),
        }
    }
}

impl FailureDetector for DeadlineDetector {
    fn heartbeat(&self, peer: &str, now_ms: u64) {
        let mut last_seen = self.last_seen.write();
        let entry = last_seen.entry(peer.to_string()).or_insert(now_ms);
        *entry = (*entry).max(now_ms);
    }

    #[allow(clippy::cast_precision_loss)]
    fn phi(&self, peer: &str, now_ms: u64) -> f64 {
        self.last_seen.read().get(peer).map_or(0.0, |&last| {
            now_ms.saturating_sub(last) as f64 / self.timeout_ms as f64
        })
    }

    fn is_available(&self, peer: &str, now_ms: u64) -> bool {
        self.last_seen
            .read()
            .get(peer)
            .is_none_or(|&last| now_ms.saturating_sub(last) <= self.timeout_ms)
    }

    fn forget(&self, peer: &str) {
        self.last_seen.write().remove(peer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn steady(detector: &dyn FailureDetector, peer: &str, beats: u64, every_ms: u64) -> u64 {
        let mut now = 1_000_000;
        for _ in 0..beats {
            detector.heartbeat(peer, now);
            now += every_ms;
        }
        now - every_ms
    }

    #[test]
    fn unknown_peer_is_available() {
        let detector = PhiAccrualDetector::default();
        assert!(detector.is_available("nobody", 42));
        assert!(detector.phi("nobody", 42).abs() < f64::EPSILON);
    }

    #[test]
    fn phi_grows_with_silence() {
        let detector = PhiAccrualDetector::default();
        let last = steady(&detector, "b2", 20, 1000);

        let soon = detector.phi("b2", last + 500);
        let late = detector.phi("b2", last + 1500);
        let very_late = detector.phi("b2", last + 3000);
        assert!(soon < late && late < very_late, "{soon} {late} {very_late}");
        assert!(detector.is_available("b2", last + 1000));
        assert!(!detector.is_available("b2", last + 3000));
    }

    #[test]
    fn acceptable_pause_is_a_hard_limit() {
        let detector = PhiAccrualDetector::new(PhiAccrualSettings {
            threshold: 1000.0,
            ..PhiAccrualSettings::default()
        });
        let last = steady(&detector, "b2", 5, 1000);
        assert!(!detector.is_available("b2", last + 5001));
    }

    #[test]
    fn forget_clears_history() {
        let detector = PhiAccrualDetector::default();
        let last = steady(&detector, "b2", 5, 1000);
        detector.forget("b2");
        assert!(detector.is_available("b2", last + 60_000));
    }

    #[test]
    fn window_bounds_history() {
        let detector = PhiAccrualDetector::new(PhiAccrualSettings {
            window: 3,
            ..PhiAccrualSettings::default()
        });
        steady(&detector, "b2", 10, 1000);
        assert_eq!(detector.peers.read()["b2"].intervals.len(), 3);
    }

    #[test]
    fn deadline_detector_boundaries() {
        let detector = DeadlineDetector::new(1000);
        detector.heartbeat("b2", 5000);
        assert!(detector.is_available("b2", 6000));
        assert!(!detector.is_available("b2", 6001));
        assert!((detector.phi("b2", 5500) - 0.5).abs() < 1e-9);

        detector.heartbeat("b2", 4000);
        assert!(detector.is_available("b2", 6000), "older heartbeat ignored");
    }
}
