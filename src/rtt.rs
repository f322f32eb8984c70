//! Smoothed round-trip estimation in the spirit of RFC 6298 / Jacobson-Karels.
//!
//! Each acknowledged reliable frame yields one RTT sample. The estimator
//! keeps an exponentially weighted mean and a mean deviation, and derives the
//! retransmission timeout as `SRTT + 4 * RTTVAR`, clamped to a sane range so
//! a few absurd samples cannot stall or flood the retransmission sweep.

const ALPHA: f64 = 0.125;
const BETA: f64 = 0.25;

const INITIAL_SRTT_MS: f64 = 500.0;
const INITIAL_RTTVAR_MS: f64 = 250.0;

const MIN_RTO_MS: u64 = 200;
const MAX_RTO_MS: u64 = 10_000;

#[derive(Debug, Clone)]
pub struct RttEstimator {
    srtt_ms: f64,
    rttvar_ms: f64,
}

impl Default for RttEstimator {
    fn default() -> Self {
        RttEstimator {
            srtt_ms: INITIAL_SRTT_MS,
            rttvar_ms: INITIAL_RTTVAR_MS,
        }
    }
}

impl RttEstimator {
    pub fn on_sample(&mut self, rtt_ms: u64) {
        let rtt = rtt_ms as f64;
        self.rttvar_ms = (1.0 - BETA) * self.rttvar_ms + BETA * (self.srtt_ms - rtt).abs();
        self.srtt_ms = (1.0 - ALPHA) * self.srtt_ms + ALPHA * rtt;
    }

    pub fn srtt_ms(&self) -> u64 {
        self.srtt_ms.round() as u64
    }

    /// Current retransmission timeout derived from the smoothed estimate.
    pub fn rto_ms(&self) -> u64 {
        let rto = (self.srtt_ms + 4.0 * self.rttvar_ms).round() as u64;
        rto.clamp(MIN_RTO_MS, MAX_RTO_MS)
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[test]
    fn test_initial_rto() {
        let est = RttEstimator::default();
        assert_eq!(est.srtt_ms(), 500);
        assert_eq!(est.rto_ms(), 1500);
    }

    #[test]
    fn test_sample_pulls_estimate_towards_measurement() {
        let mut est = RttEstimator::default();
        est.on_sample(100);
        assert!(est.srtt_ms() < 500);
        assert!(est.srtt_ms() > 100);
    }

    #[test]
    fn test_converges_on_stable_rtt() {
        let mut est = RttEstimator::default();
        for _ in 0..200 {
            est.on_sample(80);
        }
        assert_eq!(est.srtt_ms(), 80);
        // variance decays towards zero, so the floor takes over
        assert_eq!(est.rto_ms(), MIN_RTO_MS);
    }

    #[rstest]
    #[case::floor(1, MIN_RTO_MS)]
    #[case::ceiling(60_000, MAX_RTO_MS)]
    fn test_rto_is_clamped(#[case] sample_ms: u64, #[case] expected_rto: u64) {
        let mut est = RttEstimator::default();
        for _ in 0..200 {
            est.on_sample(sample_ms);
        }
        assert_eq!(est.rto_ms(), expected_rto);
    }

    #[test]
    fn test_jitter_widens_timeout() {
        let mut stable = RttEstimator::default();
        let mut jittery = RttEstimator::default();
        for i in 0..100 {
            stable.on_sample(100);
            jittery.on_sample(if i % 2 == 0 { 20 } else { 180 });
        }
        assert!(jittery.rto_ms() > stable.rto_ms());
    }
}
