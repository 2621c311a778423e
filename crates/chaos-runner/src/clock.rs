//! Per-node clock model.
//!
//! Every node counts local time from its boot instant at a rate skewed by a
//! constant drift. Both resolutions come from the same oscillator, so a
//! low-resolution edge always falls on a multiple of `clock_phi` high ticks.

use serde::{Deserialize, Serialize};

/// High-resolution clock frequency.
pub const HI_TICKS_PER_SECOND: u64 = 4_194_304;

const NANOS_PER_SECOND: f64 = 1e9;

/// Drifting local clock of one node.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NodeClock {
    /// Simulation time (ns) at which the node booted and its clock read zero.
    pub boot_ns: u64,
    /// Frequency error in parts per million (positive = runs fast).
    pub ppm: f64,
    /// High ticks per low tick.
    pub phi: u64,
}

impl NodeClock {
    pub fn new(boot_ns: u64, ppm: f64, phi: u64) -> Self {
        NodeClock { boot_ns, ppm, phi }
    }

    fn rate(&self) -> f64 {
        1.0 + self.ppm * 1e-6
    }

    /// Local nanoseconds elapsed at simulation time `t_ns`.
    pub fn local_ns(&self, t_ns: u64) -> f64 {
        t_ns.saturating_sub(self.boot_ns) as f64 * self.rate()
    }

    /// High-resolution reading at simulation time `t_ns`.
    pub fn hi_at(&self, t_ns: u64) -> u64 {
        (self.local_ns(t_ns) * HI_TICKS_PER_SECOND as f64 / NANOS_PER_SECOND).floor() as u64
    }

    /// Low-resolution reading at simulation time `t_ns`.
    pub fn lo_at(&self, t_ns: u64) -> u64 {
        self.hi_at(t_ns) / self.phi
    }

    /// Earliest simulation time at which the high-resolution reading is `hi`.
    pub fn time_of_hi(&self, hi: u64) -> u64 {
        let local = hi as f64 * NANOS_PER_SECOND / HI_TICKS_PER_SECOND as f64;
        let mut t = self.boot_ns + (local / self.rate()).ceil() as u64;
        // Float rounding can land a nanosecond off the edge either way
        while self.hi_at(t) < hi {
            t += 1;
        }
        while t > self.boot_ns && self.hi_at(t - 1) >= hi {
            t -= 1;
        }
        t
    }

    /// Earliest simulation time at which the low-resolution reading is `lo`.
    pub fn time_of_lo(&self, lo: u64) -> u64 {
        self.time_of_hi(lo * self.phi)
    }

    /// Simulation nanoseconds spanned by `ticks` local high-resolution ticks.
    pub fn hi_ticks_to_ns(&self, ticks: u64) -> u64 {
        (ticks as f64 * NANOS_PER_SECOND / HI_TICKS_PER_SECOND as f64 / self.rate()).round() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_ideal_clock_readings() {
        let clock = NodeClock::new(0, 0.0, 128);
        assert_eq!(clock.hi_at(1_000_000_000), HI_TICKS_PER_SECOND);
        assert_eq!(clock.lo_at(1_000_000_000), 32_768);
        assert_eq!(clock.lo_at(500_000_000), 16_384);
    }

    #[test]
    fn test_clock_counts_from_boot() {
        let clock = NodeClock::new(2_000_000, 0.0, 128);
        assert_eq!(clock.hi_at(1_000_000), 0);
        assert_eq!(clock.hi_at(2_000_000), 0);
        assert_eq!(clock.hi_at(3_000_000), 4_194);
    }

    #[test]
    fn test_drift_stretches_local_time() {
        let fast = NodeClock::new(0, 100.0, 128);
        let slow = NodeClock::new(0, -100.0, 128);
        assert_relative_eq!(fast.local_ns(1_000_000_000), 1_000_100_000.0, max_relative = 1e-12);
        assert_relative_eq!(slow.local_ns(1_000_000_000), 999_900_000.0, max_relative = 1e-12);
        assert!(fast.hi_at(1_000_000_000) > slow.hi_at(1_000_000_000));
    }

    #[test]
    fn test_time_of_hi_is_first_instant() {
        let clock = NodeClock::new(123_456, 37.5, 128);
        for hi in [0, 1, 127, 128, 40_000, 9_999_999] {
            let t = clock.time_of_hi(hi);
            assert!(clock.hi_at(t) >= hi);
            if t > clock.boot_ns {
                assert!(clock.hi_at(t - 1) < hi);
            }
        }
        let lo_edge = clock.time_of_lo(1000);
        assert_eq!(clock.lo_at(lo_edge), 1000);
        assert_eq!(clock.hi_at(lo_edge), 128_000);
    }

    #[test]
    fn test_tick_span() {
        let clock = NodeClock::new(0, 0.0, 128);
        assert_eq!(clock.hi_ticks_to_ns(4_194_304), 1_000_000_000);
        assert_eq!(clock.hi_ticks_to_ns(17), 4_053);
    }
}
