//! Clock synchronization estimator.
//!
//! Time synchronization is a side effect of relaying: the relay counter tells
//! how many slots have elapsed since the initiator started the flood, and the
//! slot length is measured from our own transmit/receive timestamps.

use serde::{Deserialize, Serialize};

/// Timestamps (hi ticks) bracketing one transmit/receive exchange.
///
/// `prev_rx_end` is the end of the reception that triggered our transmission,
/// `rx_end` the end of the neighbour's relay of that transmission.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SlotTimestamps {
    pub prev_rx_end: u64,
    pub tx_start: u64,
    pub tx_end: u64,
    pub rx_start: u64,
    pub rx_end: u64,
}

impl SlotTimestamps {
    /// `(T_tx + T_wait_tx_to_rx + T_rx + T_wait_rx_to_tx) / 2`.
    pub fn slot_sample(&self) -> u64 {
        let wait_rx_to_tx = self.tx_start.saturating_sub(self.prev_rx_end);
        let tx = self.tx_end.saturating_sub(self.tx_start);
        let wait_tx_to_rx = self.rx_start.saturating_sub(self.tx_end);
        let rx = self.rx_end.saturating_sub(self.rx_start);
        (tx + wait_tx_to_rx + rx + wait_rx_to_tx) / 2
    }
}

/// Windowed slot length average.
///
/// The first sample seeds the estimate. Once `window` samples have been
/// summed the estimate becomes their mean, and both the sum and the count are
/// halved so older samples fade out geometrically.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotEstimator {
    window: u32,
    sum: u64,
    count: u32,
    slot_len: Option<u64>,
}

impl SlotEstimator {
    pub fn new(window: u32) -> Self {
        SlotEstimator {
            window,
            ..Default::default()
        }
    }

    /// Add one sample and return the current estimate.
    pub fn add_sample(&mut self, sample: u64) -> u64 {
        if self.window == 0 {
            self.slot_len = Some(sample);
            return sample;
        }
        self.sum += sample;
        self.count += 1;
        if self.count == self.window {
            self.slot_len = Some(self.sum / self.window as u64);
            self.sum /= 2;
            self.count /= 2;
        } else if self.count == 1 {
            self.slot_len = Some(sample);
        }
        // Set by one of the branches above or by an earlier window
        self.slot_len.unwrap_or(sample)
    }

    pub fn slot_len(&self) -> Option<u64> {
        self.slot_len
    }

    /// Whether samples are averaged (one sample per round) or used directly.
    pub fn windowed(&self) -> bool {
        self.window > 0
    }
}

/// Slot length and reference time estimate of a node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncEstimate {
    estimator: SlotEstimator,
    reference_lo: u64,
    reference_offset_hi: u64,
    reference_updated: bool,
    relay_count: u8,
}

impl SyncEstimate {
    pub fn new(window: u32) -> Self {
        SyncEstimate {
            estimator: SlotEstimator::new(window),
            ..Default::default()
        }
    }

    /// Current slot length estimate in hi ticks.
    pub fn slot_len(&self) -> Option<u64> {
        self.estimator.slot_len()
    }

    pub fn estimator(&self) -> &SlotEstimator {
        &self.estimator
    }

    /// Feed one exchange into the slot length estimate.
    pub fn record_slot(&mut self, timestamps: &SlotTimestamps) -> u64 {
        self.estimator.add_sample(timestamps.slot_sample())
    }

    /// Compute the reference time from a relayed frame.
    ///
    /// `relay_counter` is the counter value being transmitted (one more than
    /// the value received), `rx_start` the start of that reception and
    /// `capture` the `(hi, lo)` pair of the next low-resolution tick.
    /// Does nothing without a slot length estimate.
    pub fn compute_reference(
        &mut self,
        relay_counter: u8,
        rx_start: u64,
        capture: (u64, u64),
        clock_phi: u64,
    ) -> bool {
        let Some(slot_len) = self.slot_len() else {
            return false;
        };
        let (cap_hi, cap_lo) = capture;
        let received = relay_counter.wrapping_sub(1);
        let rx_to_cap = cap_hi.saturating_sub(rx_start);
        let ref_to_cap = received as u64 * slot_len + rx_to_cap;

        self.reference_offset_hi = (clock_phi - 1) - ref_to_cap % clock_phi;
        self.reference_lo = cap_lo.saturating_sub(1 + ref_to_cap / clock_phi);
        self.relay_count = received;
        self.reference_updated = true;
        true
    }

    /// Reference time (lo ticks) of the last synchronized round.
    pub fn reference_lo(&self) -> u64 {
        self.reference_lo
    }

    /// High-resolution offset of the reference within its lo tick.
    pub fn reference_offset_hi(&self) -> u64 {
        self.reference_offset_hi
    }

    /// Whether the reference was updated (or extrapolated) this round.
    pub fn is_updated(&self) -> bool {
        self.reference_updated
    }

    /// Relay counter of the frame the reference was computed from.
    pub fn relay_count(&self) -> u8 {
        self.relay_count
    }

    /// Force the reference time (used for extrapolation).
    pub fn set_reference(&mut self, reference_lo: u64) {
        self.reference_lo = reference_lo;
    }

    pub fn set_updated(&mut self, updated: bool) {
        self.reference_updated = updated;
    }

    /// Mark the reference stale at round start.
    pub fn mark_stale(&mut self) {
        self.reference_updated = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn test_slot_sample_halves_round_trip() {
        let ts = SlotTimestamps {
            prev_rx_end: 1_000,
            tx_start: 41_017,
            tx_end: 42_500,
            rx_start: 82_100,
            rx_end: 83_600,
        };
        assert_eq!(ts.slot_sample(), (83_600 - 1_000) / 2);
    }

    #[test]
    fn test_first_sample_seeds_estimate() {
        let mut estimator = SlotEstimator::new(32);
        assert_eq!(estimator.slot_len(), None);
        assert_eq!(estimator.add_sample(41_000), 41_000);
        // Later samples accumulate until the window fills
        assert_eq!(estimator.add_sample(50_000), 41_000);
    }

    #[test]
    fn test_unwindowed_uses_latest_sample() {
        let mut estimator = SlotEstimator::new(0);
        estimator.add_sample(100);
        assert_eq!(estimator.add_sample(120), 120);
        assert!(!estimator.windowed());
    }

    #[test]
    fn test_windowed_estimate_converges() {
        let truth = 41_500u64;
        let window = 8;
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let mut estimator = SlotEstimator::new(window);

        // Seeded with an outlier
        estimator.add_sample(truth + 400);
        for _ in 1..window {
            let jitter: i64 = rng.gen_range(-20..=20);
            estimator.add_sample(truth.saturating_add_signed(jitter));
        }
        let estimate = estimator.slot_len().unwrap();
        assert!(estimate.abs_diff(truth) <= 70, "estimate {estimate}");

        for _ in 0..4 * window {
            let jitter: i64 = rng.gen_range(-20..=20);
            estimator.add_sample(truth.saturating_add_signed(jitter));
        }
        let estimate = estimator.slot_len().unwrap();
        assert!(estimate.abs_diff(truth) <= 25, "estimate {estimate}");
    }

    #[test]
    fn test_reference_requires_slot_length() {
        let mut sync = SyncEstimate::new(32);
        assert!(!sync.compute_reference(3, 0, (1_000, 10), 128));
        assert!(!sync.is_updated());
    }

    #[test]
    fn test_reference_from_relay_counter() {
        let mut sync = SyncEstimate::new(0);
        let slot = 40_960u64; // 320 lo ticks
        sync.record_slot(&SlotTimestamps {
            prev_rx_end: 0,
            rx_end: 2 * slot,
            ..Default::default()
        });
        assert_eq!(sync.slot_len(), Some(slot));

        // Frame received with relay counter 2, started at hi 1_000_000;
        // we transmit counter 3. The next lo tick edge is 64 hi ticks later.
        let rx_start = 1_000_000u64;
        let cap_hi = rx_start + 64;
        let cap_lo = cap_hi / 128;
        assert!(sync.compute_reference(3, rx_start, (cap_hi, cap_lo), 128));

        let ref_to_cap = 2 * slot + 64;
        assert_eq!(sync.reference_lo(), cap_lo - 1 - ref_to_cap / 128);
        assert_eq!(sync.reference_offset_hi(), 127 - ref_to_cap % 128);
        assert_eq!(sync.relay_count(), 2);
        assert!(sync.is_updated());

        // The reference lands on the lo tick containing the flood start
        let flood_start_hi = rx_start - 2 * slot;
        assert!(sync.reference_lo().abs_diff(flood_start_hi / 128) <= 1);

        sync.mark_stale();
        assert!(!sync.is_updated());
    }
}
