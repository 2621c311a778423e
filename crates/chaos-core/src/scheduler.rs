//! Round scheduler.
//!
//! Drives successive rounds from low-resolution timer callbacks:
//!
//! ```text
//! AwaitingRoundStart --timer--> Flooding --timer--> PostProcessing --> Scheduled
//!                                  ^                                      |
//!                                  +---------------- timer ---------------+
//! ```
//!
//! The role-specific parts (how the record is prepared, when a round ends,
//! how the next start is computed) live behind [`RoundStep`], implemented by
//! [`InitiatorStep`] and [`ReceiverStep`].
//!
//! | mode      | round length                             | next start                                |
//! |-----------|------------------------------------------|-------------------------------------------|
//! | bootstrap | `bootstrap_duration`                     | `end + bootstrap_gap`, or `ref + period - bootstrap_guard` once synced |
//! | steady    | `duration + guard * (1 + missed)`        | `ref + period + skew - guard * (1 + missed)` |

use crate::anomaly::RoundTally;
use crate::radio::{Hardware, RadioEvent, RoundTimer};
use crate::slot::{ActiveRound, Harvest, Role, SlotMachine};
use crate::sync::SyncEstimate;
use crate::{ChaosConfig, ConfigError};
use chaos_metrics::{metric_defs, MetricLabels};
use chaos_packet::{FloodRecord, RecordLayout};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info, trace, warn};

// ============================================================================
// Round Context
// ============================================================================

/// Scheduler phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Created, first round not started yet.
    AwaitingRoundStart,
    /// A round is running.
    Flooding,
    /// The round has been stopped and is being evaluated.
    PostProcessing,
    /// The next round start is armed.
    Scheduled,
}

/// Scheduling state carried from round to round.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundContext {
    /// Lo time at which the current (or last) round started.
    pub started_at: u64,
    /// Lo time at which the last round was stopped.
    pub ended_at: u64,
    /// Consecutive rounds with an updated reference time, while bootstrapping.
    pub skew_estimated: u8,
    /// Reference time drift over the last period, in lo ticks.
    pub period_skew: i64,
    /// Consecutive steady-state rounds without synchronization.
    pub sync_missed: u32,
    /// Reference time of the previous synchronized round.
    pub reference_old: u64,
}

impl RoundContext {
    pub fn is_bootstrapping(&self, config: &ChaosConfig) -> bool {
        self.skew_estimated < config.bootstrap_periods
    }

    /// Guard time scaled by the number of consecutive misses.
    pub fn guard(&self, config: &ChaosConfig) -> u64 {
        config.guard.saturating_mul(1 + self.sync_missed as u64)
    }

    /// Update the skew from the change in reference time over one period.
    ///
    /// Only done when `sync` is marked updated (computed or extrapolated).
    pub fn estimate_period_skew(&mut self, sync: &SyncEstimate, config: &ChaosConfig) -> bool {
        if !sync.is_updated() {
            return false;
        }
        let expected = self.reference_old + config.period;
        self.period_skew = sync.reference_lo() as i64 - expected as i64;
        self.reference_old = sync.reference_lo();

        if self.is_bootstrapping(config) {
            self.skew_estimated += 1;
            if !self.is_bootstrapping(config) {
                info!(skew = self.period_skew, "bootstrap complete");
            }
        }
        true
    }
}

// ============================================================================
// Round Steps
// ============================================================================

/// Role-specific round logic.
pub trait RoundStep: fmt::Debug + Send {
    fn role(&self) -> Role;

    /// Prepare the local record before the round starts.
    ///
    /// Returns `false` if the contribution index does not fit the bitmap.
    fn prepare(&mut self, record: &mut FloodRecord, index: u16) -> bool;

    /// Lo time at which the round that started at `ctx.started_at` ends.
    fn round_end(&self, ctx: &RoundContext, config: &ChaosConfig) -> u64;

    /// Update counters and the reference time after a round and return the
    /// lo time of the next round start.
    fn post_process(
        &self,
        ctx: &mut RoundContext,
        sync: &mut SyncEstimate,
        config: &ChaosConfig,
    ) -> u64;
}

/// Payload writer used by the initiator: `(seq_no, payload)`.
pub type PayloadFn = Box<dyn FnMut(u32, &mut [u8]) + Send>;

/// Initiator: starts every flood.
pub struct InitiatorStep {
    payload: PayloadFn,
}

impl InitiatorStep {
    /// Initiator stamping `payload[i] = 0x11 * i` every round.
    pub fn new() -> Self {
        Self::with_payload(Box::new(|_, payload| {
            for (i, byte) in payload.iter_mut().enumerate() {
                *byte = (i as u8).wrapping_mul(0x11);
            }
        }))
    }

    pub fn with_payload(payload: PayloadFn) -> Self {
        InitiatorStep { payload }
    }
}

impl Default for InitiatorStep {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for InitiatorStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InitiatorStep").finish_non_exhaustive()
    }
}

impl RoundStep for InitiatorStep {
    fn role(&self) -> Role {
        Role::Initiator
    }

    fn prepare(&mut self, record: &mut FloodRecord, index: u16) -> bool {
        record.seq_no = record.seq_no.wrapping_add(1);
        (self.payload)(record.seq_no, &mut record.payload);
        record.set_own_contribution(index)
    }

    fn round_end(&self, ctx: &RoundContext, config: &ChaosConfig) -> u64 {
        ctx.started_at + config.duration
    }

    fn post_process(
        &self,
        ctx: &mut RoundContext,
        sync: &mut SyncEstimate,
        config: &ChaosConfig,
    ) -> u64 {
        if !sync.is_updated() {
            // The initiator knows when its own flood began
            sync.set_reference(ctx.started_at);
            sync.set_updated(true);
        }
        let next = sync.reference_lo() + config.period;
        ctx.estimate_period_skew(sync, config);
        next
    }
}

/// Receiver: joins floods and tracks the initiator's clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReceiverStep;

impl RoundStep for ReceiverStep {
    fn role(&self) -> Role {
        Role::Receiver
    }

    fn prepare(&mut self, record: &mut FloodRecord, index: u16) -> bool {
        record.set_own_contribution(index)
    }

    fn round_end(&self, ctx: &RoundContext, config: &ChaosConfig) -> u64 {
        if ctx.is_bootstrapping(config) {
            ctx.started_at + config.bootstrap_duration()
        } else {
            ctx.started_at + ctx.guard(config) + config.duration
        }
    }

    fn post_process(
        &self,
        ctx: &mut RoundContext,
        sync: &mut SyncEstimate,
        config: &ChaosConfig,
    ) -> u64 {
        let synced = sync.is_updated();
        if ctx.is_bootstrapping(config) {
            if !synced {
                ctx.skew_estimated = 0;
            }
        } else if !synced {
            let extrapolated =
                (sync.reference_lo() + config.period).saturating_add_signed(ctx.period_skew);
            sync.set_reference(extrapolated);
            sync.set_updated(true);
            ctx.sync_missed += 1;
        } else {
            ctx.sync_missed = 0;
        }

        ctx.estimate_period_skew(sync, config);

        if ctx.is_bootstrapping(config) {
            if ctx.skew_estimated == 0 {
                ctx.ended_at + config.bootstrap_period() - config.bootstrap_duration()
            } else {
                (sync.reference_lo() + config.period).saturating_sub(config.bootstrap_guard)
            }
        } else {
            (sync.reference_lo() + config.period)
                .saturating_add_signed(ctx.period_skew)
                .saturating_sub(ctx.guard(config))
        }
    }
}

// ============================================================================
// Round Report
// ============================================================================

/// Outcome of one round, produced after stop-and-harvest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundReport {
    pub node_id: u16,
    pub role: Role,
    pub seq_no: u32,
    pub started_at: u64,
    pub ended_at: u64,
    pub next_start: u64,
    /// Valid receptions (0 = heard nothing).
    pub reception_count: u16,
    pub transmissions: u8,
    pub timeout_transmissions: u16,
    /// A complete bitmap was observed.
    pub complete: bool,
    /// Contribution bitmap at round end.
    pub flags: Vec<u8>,
    /// The reference time was computed from this round's flood.
    pub synced: bool,
    pub bootstrapping: bool,
    pub sync_missed: u32,
    pub slot_len: Option<u64>,
    pub reference_lo: u64,
    pub period_skew: i64,
    /// Lo ticks from the reference time to the first reception.
    pub latency_lo: Option<u64>,
    pub tally: RoundTally,
}

impl RoundReport {
    /// Number of participants present in the bitmap.
    pub fn contributors(&self) -> u32 {
        self.flags.iter().map(|b| b.count_ones()).sum()
    }
}

impl fmt::Display for RoundReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "node {} seq {} rx {} tx {} flags {} {}{}",
            self.node_id,
            self.seq_no,
            self.reception_count,
            self.transmissions,
            self.flags
                .iter()
                .map(|b| format!("{b:02x}"))
                .collect::<String>(),
            if self.complete { "complete" } else { "partial" },
            if self.synced { "" } else { " (no sync)" },
        )
    }
}

// ============================================================================
// Scheduler
// ============================================================================

/// Runs Chaos rounds for one node.
#[derive(Debug)]
pub struct RoundScheduler {
    config: ChaosConfig,
    layout: RecordLayout,
    node_id: u16,
    index: u16,
    step: Box<dyn RoundStep>,
    phase: Phase,
    ctx: RoundContext,
    idle: Option<(SlotMachine, FloodRecord)>,
    round: Option<ActiveRound>,
    labels: Vec<(&'static str, String)>,
    reports: Vec<RoundReport>,
}

impl RoundScheduler {
    /// Scheduler for `node_id` with the default step of `role`.
    pub fn new(config: ChaosConfig, node_id: u16, role: Role, seed: u64) -> Result<Self, ConfigError> {
        let step: Box<dyn RoundStep> = match role {
            Role::Initiator => Box::new(InitiatorStep::new()),
            Role::Receiver => Box::new(ReceiverStep),
        };
        Self::with_step(config, node_id, step, seed)
    }

    /// Scheduler with a custom round step.
    pub fn with_step(
        config: ChaosConfig,
        node_id: u16,
        step: Box<dyn RoundStep>,
        seed: u64,
    ) -> Result<Self, ConfigError> {
        let index = config.node_index(node_id)?;
        let machine = SlotMachine::new(&config, seed)?;
        let layout = *machine.layout();
        let record = FloodRecord::new(&layout);
        let labels = MetricLabels::new(node_id.to_string(), step.role().as_str()).to_labels();
        Ok(RoundScheduler {
            config,
            layout,
            node_id,
            index,
            step,
            phase: Phase::AwaitingRoundStart,
            ctx: RoundContext::default(),
            idle: Some((machine, record)),
            round: None,
            labels,
            reports: Vec::new(),
        })
    }

    pub fn node_id(&self) -> u16 {
        self.node_id
    }

    /// Contribution index of this node.
    pub fn index(&self) -> u16 {
        self.index
    }

    pub fn role(&self) -> Role {
        self.step.role()
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn config(&self) -> &ChaosConfig {
        &self.config
    }

    pub fn layout(&self) -> &RecordLayout {
        &self.layout
    }

    pub fn context(&self) -> &RoundContext {
        &self.ctx
    }

    pub fn is_bootstrapping(&self) -> bool {
        self.ctx.is_bootstrapping(&self.config)
    }

    /// Running round, if any.
    pub fn round(&self) -> Option<&ActiveRound> {
        self.round.as_ref()
    }

    /// Synchronization estimate, wherever it currently lives.
    pub fn sync(&self) -> Option<&SyncEstimate> {
        match (&self.round, &self.idle) {
            (Some(round), _) => Some(round.sync()),
            (None, Some((machine, _))) => Some(machine.sync()),
            (None, None) => None,
        }
    }

    /// Local record between rounds.
    pub fn record(&self) -> Option<&FloodRecord> {
        self.idle.as_ref().map(|(_, record)| record)
    }

    /// Drain the reports of finished rounds.
    pub fn take_reports(&mut self) -> Vec<RoundReport> {
        std::mem::take(&mut self.reports)
    }

    /// Arm the first round. Both roles start right away; a receiver then
    /// listens in bootstrap mode until it hears the initiator.
    pub fn boot<T: RoundTimer>(&mut self, now_lo: u64, timer: &mut T) {
        info!(
            node = self.node_id,
            index = self.index,
            role = %self.step.role(),
            "node booted"
        );
        self.phase = Phase::AwaitingRoundStart;
        timer.schedule_at(now_lo);
    }

    /// Timer callback: starts or ends a round depending on the phase.
    pub fn on_timer<H: Hardware, T: RoundTimer>(&mut self, fired_at: u64, hw: &mut H, timer: &mut T) {
        match self.phase {
            Phase::AwaitingRoundStart | Phase::Scheduled => self.start_round(fired_at, hw, timer),
            Phase::Flooding => self.finish_round(fired_at, hw, timer),
            Phase::PostProcessing => warn!(node = self.node_id, "timer fired during post-processing"),
        }
    }

    /// Radio callback: forwarded to the running round.
    pub fn on_radio<H: Hardware>(&mut self, event: RadioEvent<'_>, hw: &mut H) {
        match self.round.as_mut() {
            Some(round) => round.handle(event, hw),
            None => trace!(node = self.node_id, ?event, "radio event outside a round"),
        }
    }

    fn start_round<H: Hardware, T: RoundTimer>(&mut self, fired_at: u64, hw: &mut H, timer: &mut T) {
        let Some((machine, mut record)) = self.idle.take() else {
            warn!(node = self.node_id, "round start without an idle machine");
            return;
        };
        self.ctx.started_at = fired_at;
        if !self.step.prepare(&mut record, self.index) {
            warn!(node = self.node_id, index = self.index, "contribution index outside the bitmap");
        }

        match machine.start(record, self.step.role(), self.config.n_tx, hw) {
            Ok(round) => {
                trace!(node = self.node_id, at = fired_at, seq = round.record().seq_no, "round start");
                self.round = Some(round);
                self.phase = Phase::Flooding;
                timer.schedule_at(self.step.round_end(&self.ctx, &self.config));
            }
            Err(e) => {
                warn!(node = self.node_id, "{}", e);
                self.idle = Some((e.machine, e.record));
                self.phase = Phase::Scheduled;
                timer.schedule_at(fired_at + self.config.period);
            }
        }
    }

    fn finish_round<H: Hardware, T: RoundTimer>(&mut self, ended_at: u64, hw: &mut H, timer: &mut T) {
        let Some(round) = self.round.take() else {
            warn!(node = self.node_id, "round end without a running round");
            return;
        };
        self.phase = Phase::PostProcessing;
        let (mut machine, harvest) = round.stop(hw);
        self.ctx.ended_at = ended_at;

        let synced = machine.sync().is_updated();
        let missed_before = self.ctx.sync_missed;
        let mut next = self
            .step
            .post_process(&mut self.ctx, machine.sync_mut(), &self.config);
        if next <= ended_at {
            warn!(node = self.node_id, next, ended_at, "next round start already passed");
            next = ended_at + 1;
        }
        let missed = self.ctx.sync_missed > missed_before;
        if missed {
            warn!(node = self.node_id, missed = self.ctx.sync_missed, "synchronization missed");
        }

        let report = self.build_report(&machine, &harvest, synced, next);
        debug!(node = self.node_id, "{}", report);
        self.emit_metrics(&report, missed);
        self.reports.push(report);

        self.idle = Some((machine, harvest.record));
        self.phase = Phase::Scheduled;
        timer.schedule_at(next);
    }

    fn build_report(
        &self,
        machine: &SlotMachine,
        harvest: &Harvest,
        synced: bool,
        next_start: u64,
    ) -> RoundReport {
        let sync = machine.sync();
        let latency_lo = harvest
            .first_rx_lo
            .filter(|_| synced)
            .map(|first| first.saturating_sub(sync.reference_lo()));
        RoundReport {
            node_id: self.node_id,
            role: self.step.role(),
            seq_no: harvest.record.seq_no,
            started_at: self.ctx.started_at,
            ended_at: self.ctx.ended_at,
            next_start,
            reception_count: harvest.reception_count,
            transmissions: harvest.transmissions,
            timeout_transmissions: harvest.timeout_transmissions,
            complete: harvest.complete || harvest.record.is_complete(&self.layout),
            flags: harvest.record.flags.clone(),
            synced,
            bootstrapping: self.ctx.is_bootstrapping(&self.config),
            sync_missed: self.ctx.sync_missed,
            slot_len: sync.slot_len(),
            reference_lo: sync.reference_lo(),
            period_skew: self.ctx.period_skew,
            latency_lo,
            tally: harvest.tally,
        }
    }

    fn emit_metrics(&self, report: &RoundReport, missed: bool) {
        let labels = self.labels.as_slice();
        let tally = &report.tally;

        metrics::counter!(metric_defs::ROUNDS.name, labels).increment(1);
        if report.complete {
            metrics::counter!(metric_defs::ROUNDS_COMPLETE.name, labels).increment(1);
        }
        if missed {
            metrics::counter!(metric_defs::SYNC_MISSED.name, labels).increment(1);
        }
        metrics::counter!(metric_defs::RX_PACKETS.name, labels)
            .increment(report.reception_count as u64);
        metrics::counter!(metric_defs::TX_PACKETS.name, labels)
            .increment(report.transmissions as u64);
        metrics::counter!(metric_defs::TIMEOUT_TX.name, labels)
            .increment(report.timeout_transmissions as u64);
        metrics::counter!(metric_defs::MALFORMED_FRAMES.name, labels)
            .increment(tally.malformed as u64);
        metrics::counter!(metric_defs::CORRUPT_FRAMES.name, labels).increment(tally.corrupt as u64);
        metrics::counter!(metric_defs::TIMING_OVERRUNS.name, labels)
            .increment(tally.timing_overruns as u64);
        metrics::counter!(metric_defs::RX_TIMEOUTS.name, labels)
            .increment(tally.rx_timeouts as u64);
        metrics::histogram!(metric_defs::RECEPTION_COUNT.name, labels)
            .record(report.reception_count as f64);
        if let Some(slot_len) = report.slot_len {
            metrics::gauge!(metric_defs::SLOT_LENGTH.name, labels).set(slot_len as f64);
        }
        metrics::gauge!(metric_defs::PERIOD_SKEW.name, labels).set(report.period_skew as f64);
    }
}
