//! Simulated radio and clock behind the core's hardware seams.
//!
//! A [`SimHardware`] lives for the duration of one callback into a node. It
//! answers clock queries from the node's drifting [`NodeClock`], advances the
//! node's notion of "now" through busy-waits, and records every radio and
//! compare-channel request as an [`HwAction`] for the simulation to apply.

use crate::clock::NodeClock;
use chaos_core::{Clock, Radio, RoundTimer};
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

/// Service latency of the simulated CPU, in hi ticks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingModel {
    /// Uniform jitter added to every busy-wait, `0..=jitter_ticks`.
    pub jitter_ticks: u64,
    /// Probability of a long interrupt delay during a busy-wait.
    pub overrun_probability: f64,
    /// Extra latency of such a delay.
    pub overrun_ticks: u64,
}

impl Default for TimingModel {
    fn default() -> Self {
        TimingModel {
            jitter_ticks: 2,
            overrun_probability: 0.0005,
            overrun_ticks: 64,
        }
    }
}

impl TimingModel {
    /// No jitter and no overruns.
    pub fn ideal() -> Self {
        TimingModel {
            jitter_ticks: 0,
            overrun_probability: 0.0,
            overrun_ticks: 0,
        }
    }
}

/// A request made by a node during a callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HwAction {
    RadioOn,
    RadioOff,
    FlushRx,
    Transmit { at_ns: u64, frame: Vec<u8> },
    ArmCompare { at_hi: u64 },
    CancelCompare,
}

/// Hardware view of one node for one callback.
#[derive(Debug)]
pub struct SimHardware<'a> {
    clock: NodeClock,
    timing: &'a TimingModel,
    rng: &'a mut ChaCha8Rng,
    now_ns: u64,
    actions: Vec<HwAction>,
}

impl<'a> SimHardware<'a> {
    pub fn new(clock: NodeClock, timing: &'a TimingModel, rng: &'a mut ChaCha8Rng, now_ns: u64) -> Self {
        SimHardware {
            clock,
            timing,
            rng,
            now_ns,
            actions: Vec::new(),
        }
    }

    /// Simulation time as seen by the node, after any waits it performed.
    pub fn now_ns(&self) -> u64 {
        self.now_ns
    }

    pub fn actions(&self) -> &[HwAction] {
        &self.actions
    }

    pub fn into_actions(self) -> Vec<HwAction> {
        self.actions
    }

    fn service_latency(&mut self) -> u64 {
        let mut ticks = if self.timing.jitter_ticks > 0 {
            self.rng.gen_range(0..=self.timing.jitter_ticks)
        } else {
            0
        };
        if self.timing.overrun_probability > 0.0 && self.rng.gen::<f64>() < self.timing.overrun_probability {
            ticks += self.timing.overrun_ticks;
        }
        ticks
    }
}

impl Radio for SimHardware<'_> {
    fn on(&mut self) {
        self.actions.push(HwAction::RadioOn);
    }

    fn off(&mut self) {
        self.actions.push(HwAction::RadioOff);
    }

    fn transmit(&mut self, frame: &[u8]) {
        self.actions.push(HwAction::Transmit {
            at_ns: self.now_ns,
            frame: frame.to_vec(),
        });
    }

    fn flush_rx(&mut self) {
        self.actions.push(HwAction::FlushRx);
    }
}

impl Clock for SimHardware<'_> {
    fn now_hi(&self) -> u64 {
        self.clock.hi_at(self.now_ns)
    }

    fn now_lo(&self) -> u64 {
        self.clock.lo_at(self.now_ns)
    }

    fn capture_next_tick(&mut self) -> (u64, u64) {
        let lo = self.clock.lo_at(self.now_ns) + 1;
        self.now_ns = self.now_ns.max(self.clock.time_of_lo(lo));
        (self.clock.hi_at(self.now_ns), lo)
    }

    fn wait_until_hi(&mut self, target: u64) -> u64 {
        let reached = self.now_ns.max(self.clock.time_of_hi(target));
        let latency = self.service_latency();
        self.now_ns = reached + self.clock.hi_ticks_to_ns(latency);
        self.clock.hi_at(self.now_ns)
    }

    fn compensate(&mut self, ticks: u64) {
        self.now_ns += self.clock.hi_ticks_to_ns(ticks);
    }

    fn arm_compare(&mut self, at: u64) {
        self.actions.push(HwAction::ArmCompare { at_hi: at });
    }

    fn cancel_compare(&mut self) {
        self.actions.push(HwAction::CancelCompare);
    }
}

/// Collects the round timer requests of one callback.
#[derive(Debug, Default)]
pub struct RoundAlarm {
    requests: Vec<u64>,
}

impl RoundAlarm {
    /// Requested low-resolution start times, oldest first.
    pub fn take(&mut self) -> Vec<u64> {
        std::mem::take(&mut self.requests)
    }
}

impl RoundTimer for RoundAlarm {
    fn schedule_at(&mut self, at: u64) {
        self.requests.push(at);
    }
}
