//! Timeout/backoff controller.
//!
//! After each transmission a node arms a timeout of a random number of slots.
//! If nothing is received before it expires, the node transmits on its own so
//! that a lossy hop cannot stall the flood.

use crate::ChaosConfig;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Random slot-count backoff bound to one compare deadline.
#[derive(Debug, Clone)]
pub struct Backoff {
    enabled: bool,
    min_slots: u8,
    max_slots: u8,
    rng: ChaCha8Rng,
    n_slots: u8,
    deadline: Option<u64>,
}

impl Backoff {
    /// Create a controller seeded with `seed`.
    pub fn new(config: &ChaosConfig, seed: u64) -> Self {
        Backoff {
            enabled: config.timeout,
            min_slots: config.min_slots,
            max_slots: config.max_slots,
            rng: ChaCha8Rng::seed_from_u64(seed),
            n_slots: 0,
            deadline: None,
        }
    }

    /// Draw a slot count uniformly from `[min_slots, max_slots]`.
    pub fn draw_slots(&mut self) -> u8 {
        self.rng.gen_range(self.min_slots..=self.max_slots)
    }

    /// Arm a new deadline counted from `from`.
    ///
    /// Returns `None` (and arms nothing) when timeouts are disabled or no slot
    /// length estimate exists yet.
    pub fn schedule(&mut self, from: u64, slot_len: Option<u64>) -> Option<u64> {
        let slot_len = slot_len.filter(|&len| len > 0)?;
        if !self.enabled {
            return None;
        }
        self.n_slots = self.draw_slots();
        let deadline = from + self.n_slots as u64 * slot_len;
        self.deadline = Some(deadline);
        Some(deadline)
    }

    /// Slot count of the last draw (0 before the first one).
    pub fn n_slots(&self) -> u8 {
        self.n_slots
    }

    /// Currently armed deadline.
    pub fn deadline(&self) -> Option<u64> {
        self.deadline
    }

    /// Disarm and return the deadline that was pending.
    pub fn cancel(&mut self) -> Option<u64> {
        self.deadline.take()
    }

    /// Re-arm a deadline that was suspended during a reception.
    pub fn resume(&mut self, deadline: u64) {
        self.deadline = Some(deadline);
    }

    /// Consume the deadline if `at` has reached it.
    pub fn expire(&mut self, at: u64) -> bool {
        match self.deadline {
            Some(deadline) if at >= deadline => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }
}
