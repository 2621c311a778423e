//! Discrete-event simulation of a Chaos network.
//!
//! All nodes share one event queue ordered by simulation time (ns). Each
//! callback into a node runs its [`RoundScheduler`] against a [`SimHardware`]
//! view; the recorded hardware actions are then applied to the [`Medium`] and
//! turned into future events.

use crate::clock::NodeClock;
use crate::error::{RunnerError, TopologyError};
use crate::hardware::{HwAction, RoundAlarm, SimHardware, TimingModel};
use crate::medium::{Medium, MediumCounters};
use crate::topology::Topology;
use chaos_core::{Clock, RadioEvent, Role, RoundReport, RoundScheduler, RoundTally};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BinaryHeap};
use std::fmt;
use tracing::{debug, info, trace};

// ============================================================================
// Events
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SimEvent {
    Boot { node: usize },
    RoundTimer { node: usize, generation: u64 },
    Compare { node: usize, generation: u64, at_hi: u64 },
    Sfd { frame: u64 },
    AirEnd { frame: u64 },
    RxHeader { node: usize, lock: u64 },
    RxEnd { node: usize, lock: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct QueuedEvent {
    time: u64,
    seq: u64,
    event: SimEvent,
}

impl Ord for QueuedEvent {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse ordering for min-heap (earliest time first, then FIFO)
        other
            .time
            .cmp(&self.time)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueuedEvent {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Clone, Copy)]
enum NodeInput<'a> {
    Boot,
    Timer,
    Radio(RadioEvent<'a>),
}

// ============================================================================
// Statistics
// ============================================================================

/// Per-node results.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeStats {
    pub id: u16,
    pub role: Role,
    pub ppm: f64,
    pub rounds: u32,
    pub complete_rounds: u32,
    pub synced_rounds: u32,
    pub receptions: u64,
    pub transmissions: u64,
    pub timeout_transmissions: u64,
    pub tally: RoundTally,
    latency_sum_lo: u64,
    latency_samples: u32,
    pub reports: Vec<RoundReport>,
}

impl NodeStats {
    fn new(id: u16, role: Role, ppm: f64) -> Self {
        NodeStats {
            id,
            role,
            ppm,
            rounds: 0,
            complete_rounds: 0,
            synced_rounds: 0,
            receptions: 0,
            transmissions: 0,
            timeout_transmissions: 0,
            tally: RoundTally::default(),
            latency_sum_lo: 0,
            latency_samples: 0,
            reports: Vec::new(),
        }
    }

    fn record(&mut self, report: RoundReport) {
        self.rounds += 1;
        if report.complete {
            self.complete_rounds += 1;
        }
        if report.synced {
            self.synced_rounds += 1;
        }
        self.receptions += report.reception_count as u64;
        self.transmissions += report.transmissions as u64;
        self.timeout_transmissions += report.timeout_transmissions as u64;
        self.tally.absorb(&report.tally);
        if let Some(latency) = report.latency_lo {
            self.latency_sum_lo += latency;
            self.latency_samples += 1;
        }
        self.reports.push(report);
    }

    /// Fraction of rounds that ended with a complete bitmap.
    pub fn completion_ratio(&self) -> f64 {
        if self.rounds == 0 {
            0.0
        } else {
            self.complete_rounds as f64 / self.rounds as f64
        }
    }

    /// Mean lo ticks from the reference time to the first reception.
    pub fn mean_latency_lo(&self) -> Option<f64> {
        (self.latency_samples > 0).then(|| self.latency_sum_lo as f64 / self.latency_samples as f64)
    }

    pub fn last_report(&self) -> Option<&RoundReport> {
        self.reports.last()
    }
}

/// Results of a simulation run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SimulationStats {
    pub simulation_time_us: u64,
    pub total_events: u64,
    pub medium: MediumCounters,
    pub nodes: Vec<NodeStats>,
}

impl SimulationStats {
    pub fn node(&self, id: u16) -> Option<&NodeStats> {
        self.nodes.iter().find(|node| node.id == id)
    }

    /// Anomalies of all nodes and rounds.
    pub fn total_tally(&self) -> RoundTally {
        let mut total = RoundTally::default();
        for node in &self.nodes {
            total.absorb(&node.tally);
        }
        total
    }
}

impl fmt::Display for SimulationStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "simulated {:.3} s, {} events, {} frames ({} delivered, {} corrupted, {} constructive, {} captures)",
            self.simulation_time_us as f64 / 1e6,
            self.total_events,
            self.medium.transmissions,
            self.medium.delivered,
            self.medium.corrupted,
            self.medium.constructive,
            self.medium.captures,
        )?;
        writeln!(
            f,
            "{:>5} {:<9} {:>8} {:>7} {:>9} {:>7} {:>7} {:>9} {:>10}",
            "node", "role", "ppm", "rounds", "complete", "synced", "rx", "tx", "latency"
        )?;
        for node in &self.nodes {
            let latency = node
                .mean_latency_lo()
                .map(|l| format!("{l:.1}"))
                .unwrap_or_else(|| "-".to_string());
            writeln!(
                f,
                "{:>5} {:<9} {:>8.2} {:>7} {:>8.1}% {:>7} {:>7} {:>9} {:>10}",
                node.id,
                node.role.as_str(),
                node.ppm,
                node.rounds,
                node.completion_ratio() * 100.0,
                node.synced_rounds,
                node.receptions,
                node.transmissions,
                latency,
            )?;
        }
        let tally = self.total_tally();
        write!(
            f,
            "anomalies: {} malformed, {} corrupt, {} overruns, {} rx timeouts",
            tally.malformed, tally.corrupt, tally.timing_overruns, tally.rx_timeouts
        )
    }
}

// ============================================================================
// Simulation
// ============================================================================

#[derive(Debug)]
struct SimNode {
    id: u16,
    scheduler: RoundScheduler,
    clock: NodeClock,
    rng: ChaCha8Rng,
    compare_generation: u64,
    timer_generation: u64,
}

/// A simulated Chaos network.
#[derive(Debug)]
pub struct Simulation {
    timing: TimingModel,
    medium: Medium,
    nodes: Vec<SimNode>,
    queue: BinaryHeap<QueuedEvent>,
    seq: u64,
    now_ns: u64,
    rng: ChaCha8Rng,
    stats: SimulationStats,
}

impl Simulation {
    /// Build a simulation of `topology`. All randomness derives from `seed`.
    pub fn build(topology: &Topology, seed: u64) -> Result<Self, RunnerError> {
        topology.validate()?;
        let config = &topology.config;
        let mut master = ChaCha8Rng::seed_from_u64(seed);
        let drift = Normal::new(0.0, topology.drift_std_ppm).map_err(|_| {
            TopologyError::InvalidProbability {
                what: "drift_std_ppm",
                value: topology.drift_std_ppm,
            }
        })?;

        let mut nodes = Vec::with_capacity(topology.nodes.len());
        let mut stats = SimulationStats::default();
        let mut indices = BTreeMap::new();
        for (index, entry) in topology.nodes.iter().enumerate() {
            let ppm = entry.ppm.unwrap_or_else(|| drift.sample(&mut master));
            let role = if entry.initiator {
                Role::Initiator
            } else {
                Role::Receiver
            };
            let scheduler = RoundScheduler::new(config.clone(), entry.id, role, master.gen())?;
            let clock = NodeClock::new(entry.boot_ms * 1_000_000, ppm, config.clock_phi);
            debug!(node = entry.id, %role, ppm, boot_ms = entry.boot_ms, "node created");

            indices.insert(entry.id, index);
            stats.nodes.push(NodeStats::new(entry.id, role, ppm));
            nodes.push(SimNode {
                id: entry.id,
                scheduler,
                clock,
                rng: ChaCha8Rng::seed_from_u64(master.gen()),
                compare_generation: 0,
                timer_generation: 0,
            });
        }

        let links = topology
            .link_map()
            .into_iter()
            .filter_map(|((a, b), prr)| Some(((*indices.get(&a)?, *indices.get(&b)?), prr)))
            .collect();
        let medium = Medium::new(topology.medium.clone(), nodes.len(), links);

        let mut simulation = Simulation {
            timing: topology.timing.clone(),
            medium,
            nodes,
            queue: BinaryHeap::new(),
            seq: 0,
            now_ns: 0,
            rng: ChaCha8Rng::seed_from_u64(master.gen()),
            stats,
        };
        for index in 0..simulation.nodes.len() {
            let boot = simulation.nodes[index].clock.boot_ns;
            simulation.push(boot, SimEvent::Boot { node: index });
        }
        Ok(simulation)
    }

    /// Current simulation time in ns.
    pub fn now_ns(&self) -> u64 {
        self.now_ns
    }

    pub fn stats(&self) -> &SimulationStats {
        &self.stats
    }

    pub fn into_stats(self) -> SimulationStats {
        self.stats
    }

    /// Scheduler of node `id`.
    pub fn scheduler(&self, id: u16) -> Option<&RoundScheduler> {
        self.nodes
            .iter()
            .find(|node| node.id == id)
            .map(|node| &node.scheduler)
    }

    pub fn medium(&self) -> &Medium {
        &self.medium
    }

    /// Process every event up to and including `end_ns`.
    pub fn run_until(&mut self, end_ns: u64) -> &SimulationStats {
        info!(
            nodes = self.nodes.len(),
            from_ms = self.now_ns / 1_000_000,
            to_ms = end_ns / 1_000_000,
            "simulation running"
        );
        while self.queue.peek().is_some_and(|next| next.time <= end_ns) {
            if let Some(next) = self.queue.pop() {
                self.now_ns = next.time;
                self.stats.total_events += 1;
                self.process(next.event);
            }
        }
        self.now_ns = self.now_ns.max(end_ns);
        self.stats.simulation_time_us = self.now_ns / 1_000;
        self.stats.medium = self.medium.counters().clone();
        &self.stats
    }

    /// Advance by `seconds` of simulation time.
    pub fn run_for(&mut self, seconds: f64) -> Result<&SimulationStats, RunnerError> {
        if !seconds.is_finite() || seconds <= 0.0 {
            return Err(RunnerError::InvalidDuration(seconds));
        }
        let end = self.now_ns + (seconds * 1e9).round() as u64;
        Ok(self.run_until(end))
    }

    fn push(&mut self, time: u64, event: SimEvent) {
        self.seq += 1;
        self.queue.push(QueuedEvent {
            time,
            seq: self.seq,
            event,
        });
    }

    fn hi_now(&self, node: usize) -> u64 {
        self.nodes[node].clock.hi_at(self.now_ns)
    }

    fn process(&mut self, event: SimEvent) {
        trace!(at = self.now_ns, ?event, "event");
        match event {
            SimEvent::Boot { node } => self.dispatch(node, NodeInput::Boot),
            SimEvent::RoundTimer { node, generation } => {
                if self.nodes[node].timer_generation == generation {
                    self.dispatch(node, NodeInput::Timer);
                }
            }
            SimEvent::Compare {
                node,
                generation,
                at_hi,
            } => {
                if self.nodes[node].compare_generation == generation {
                    let at = at_hi.max(self.hi_now(node));
                    self.dispatch(node, NodeInput::Radio(RadioEvent::Compare { at }));
                }
            }
            SimEvent::Sfd { frame } => {
                let outcome = self.medium.on_sfd(frame, &mut self.rng);
                if let Some(source) = outcome.source {
                    let at = self.hi_now(source);
                    self.dispatch(source, NodeInput::Radio(RadioEvent::FrameStart { at }));
                }
                let header_delay = self.medium.config().header_bytes * self.medium.config().byte_ns;
                for (node, lock) in outcome.locked {
                    if !self.medium.is_locked(node, lock) {
                        continue;
                    }
                    self.push(self.now_ns + header_delay, SimEvent::RxHeader { node, lock });
                    self.push(outcome.end_ns, SimEvent::RxEnd { node, lock });
                    let at = self.hi_now(node);
                    self.dispatch(node, NodeInput::Radio(RadioEvent::FrameStart { at }));
                }
            }
            SimEvent::AirEnd { frame } => {
                if let Some(source) = self.medium.on_air_end(frame) {
                    let at = self.hi_now(source);
                    self.dispatch(source, NodeInput::Radio(RadioEvent::FrameEnd { at, frame: &[] }));
                }
            }
            SimEvent::RxHeader { node, lock } => {
                if let Some((length, header)) = self.medium.header_of(node, lock) {
                    self.dispatch(node, NodeInput::Radio(RadioEvent::FrameHeader { length, header }));
                }
            }
            SimEvent::RxEnd { node, lock } => {
                if let Some(bytes) = self.medium.finish_rx(node, lock) {
                    let at = self.hi_now(node);
                    self.dispatch(node, NodeInput::Radio(RadioEvent::FrameEnd { at, frame: &bytes }));
                }
            }
        }
    }

    /// Run one callback on `node` and apply what it asked for.
    fn dispatch(&mut self, node: usize, input: NodeInput<'_>) {
        let now = self.now_ns;
        let mut alarm = RoundAlarm::default();
        let actions = {
            let sim_node = &mut self.nodes[node];
            let mut hw = SimHardware::new(sim_node.clock, &self.timing, &mut sim_node.rng, now);
            match input {
                NodeInput::Boot => {
                    let lo = hw.now_lo();
                    sim_node.scheduler.boot(lo, &mut alarm);
                }
                NodeInput::Timer => {
                    let lo = hw.now_lo();
                    sim_node.scheduler.on_timer(lo, &mut hw, &mut alarm);
                }
                NodeInput::Radio(event) => sim_node.scheduler.on_radio(event, &mut hw),
            }
            hw.into_actions()
        };

        self.apply(node, actions);
        for lo in alarm.take() {
            let node_state = &mut self.nodes[node];
            node_state.timer_generation += 1;
            let generation = node_state.timer_generation;
            let at = node_state.clock.time_of_lo(lo).max(now);
            self.push(at, SimEvent::RoundTimer { node, generation });
        }

        if matches!(input, NodeInput::Timer) {
            for report in self.nodes[node].scheduler.take_reports() {
                self.stats.nodes[node].record(report);
            }
        }
    }

    fn apply(&mut self, node: usize, actions: Vec<HwAction>) {
        for action in actions {
            match action {
                HwAction::RadioOn => self.medium.radio_on(node),
                HwAction::RadioOff => self.medium.radio_off(node),
                HwAction::FlushRx => self.medium.flush_rx(node),
                HwAction::Transmit { at_ns, frame } => {
                    if let Some(air) = self.medium.transmit(node, at_ns, frame) {
                        trace!(node = self.nodes[node].id, frame = air.frame, at_ns, "transmit");
                        self.push(air.sfd_ns, SimEvent::Sfd { frame: air.frame });
                        self.push(air.end_ns, SimEvent::AirEnd { frame: air.frame });
                    }
                }
                HwAction::ArmCompare { at_hi } => {
                    let node_state = &mut self.nodes[node];
                    node_state.compare_generation += 1;
                    let generation = node_state.compare_generation;
                    let at = node_state.clock.time_of_hi(at_hi).max(self.now_ns);
                    self.push(
                        at,
                        SimEvent::Compare {
                            node,
                            generation,
                            at_hi,
                        },
                    );
                }
                HwAction::CancelCompare => self.nodes[node].compare_generation += 1,
            }
        }
    }
}
