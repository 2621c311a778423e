//! Slot state machine.
//!
//! One [`ActiveRound`] executes a flood: it receives, merges and relays the
//! shared record, driven entirely by [`RadioEvent`]s. Between rounds the
//! machine is an idle [`SlotMachine`] that owns the persistent state (frame
//! buffer, synchronization estimate, backoff generator).
//!
//! ```text
//!            start(Receiver)                    start(Initiator)
//!                  |                                   |
//!                  v        FrameStart                 v
//!   +-------> Waiting ------------------> Receiving   Received --FrameStart--> Transmitting
//!   |           ^  ^                        |  |  |      ^                         |
//!   |           |  +---- no relay / bad ----+  |  |      |                         |
//!   |           |                              |  +------+ relay                   |
//!   |           +--- FrameEnd ---- Aborted <---+ bad header / deadline             |
//!   +----------------------------------------------------------- FrameEnd --------+
//! ```
//!
//! Ownership moves with the round: [`SlotMachine::start`] consumes the idle
//! machine together with the record and [`ActiveRound::stop`] hands both
//! back, so nothing outside the round can touch them while it runs.

use crate::anomaly::{Anomaly, RoundTally};
use crate::backoff::Backoff;
use crate::radio::{Hardware, RadioEvent};
use crate::sync::{SlotTimestamps, SyncEstimate};
use crate::{ChaosConfig, ConfigError};
use chaos_packet::{
    check_prefix, merge_flags, FloodRecord, PacketError, RecordLayout, WireFrame,
    HEADER_ACTIVE, HEADER_FINAL,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tracing::{debug, trace, warn};

// ============================================================================
// States and Roles
// ============================================================================

/// State of the slot state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotState {
    /// Radio off, no round running.
    Off,
    /// Listening for a frame.
    Waiting,
    /// A frame is arriving.
    Receiving,
    /// A frame is loaded and its transmission has been started.
    Received,
    /// Our own frame is on the air.
    Transmitting,
    /// A reception was abandoned; resolves to `Waiting` on the next event.
    Aborted,
}

/// Role of a node in a round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Starts every flood and owns the sequence number.
    Initiator,
    /// Joins floods started by the initiator.
    Receiver,
}

impl Role {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Role::Initiator => "initiator",
            Role::Receiver => "receiver",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the single compare channel is currently armed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ComparePurpose {
    Backoff,
    RxDeadline,
}

// ============================================================================
// Idle Machine
// ============================================================================

/// Network-wide timing parameters the state machine needs during a round.
#[derive(Debug, Clone, Copy)]
struct SlotTiming {
    sync: bool,
    final_flood: bool,
    n_tx_complete: u8,
    processing_ticks: u64,
    compensation_window_ticks: u64,
    rx_deadline_ticks: u64,
    clock_phi: u64,
}

/// Slot state machine between rounds.
#[derive(Debug, Clone)]
pub struct SlotMachine {
    layout: RecordLayout,
    timing: SlotTiming,
    frame: WireFrame,
    sync: SyncEstimate,
    backoff: Backoff,
}

/// A round could not be started; the machine and record are handed back.
#[derive(Debug, Error)]
#[error("Cannot start round: {source}")]
pub struct StartError {
    /// The untouched idle machine.
    pub machine: SlotMachine,
    /// The record that was offered.
    pub record: FloodRecord,
    #[source]
    pub source: PacketError,
}

impl SlotMachine {
    /// Create an idle machine. `seed` drives the backoff draws.
    pub fn new(config: &ChaosConfig, seed: u64) -> Result<Self, ConfigError> {
        config.validate()?;
        let layout = config.layout()?;
        Ok(SlotMachine {
            timing: SlotTiming {
                sync: config.sync,
                final_flood: config.final_flood,
                n_tx_complete: config.n_tx_complete,
                processing_ticks: config.processing_ticks,
                compensation_window_ticks: config.compensation_window_ticks,
                rx_deadline_ticks: config.rx_deadline_ticks(&layout),
                clock_phi: config.clock_phi,
            },
            frame: WireFrame::new(layout),
            sync: SyncEstimate::new(config.sync_window),
            backoff: Backoff::new(config, seed),
            layout,
        })
    }

    pub fn layout(&self) -> &RecordLayout {
        &self.layout
    }

    /// Synchronization estimate carried across rounds.
    pub fn sync(&self) -> &SyncEstimate {
        &self.sync
    }

    /// Mutable estimate, used by the scheduler to extrapolate the reference time.
    pub fn sync_mut(&mut self) -> &mut SyncEstimate {
        &mut self.sync
    }

    /// Current slot length estimate in hi ticks.
    pub fn slot_len(&self) -> Option<u64> {
        self.sync.slot_len()
    }

    /// Start a round with `record` as the local contribution.
    ///
    /// The initiator loads the record and transmits at once; a receiver turns
    /// its radio on and waits.
    pub fn start<H: Hardware>(
        mut self,
        record: FloodRecord,
        role: Role,
        max_tx: u8,
        hw: &mut H,
    ) -> Result<ActiveRound, StartError> {
        if let Err(source) = record.check(&self.layout) {
            return Err(StartError {
                machine: self,
                record,
                source,
            });
        }

        self.sync.mark_stale();
        self.backoff.cancel();
        hw.flush_rx();

        let mut round = ActiveRound {
            machine: self,
            record,
            role,
            max_tx,
            state: SlotState::Off,
            compare: None,
            suspended_backoff: None,
            force_relay: false,
            estimate_length: true,
            complete: false,
            timeout_pending: false,
            rx_start: 0,
            rx_stop: 0,
            tx_start: 0,
            tx_stop: 0,
            tx_relay_last: 0,
            relay_timeout: 0,
            relay_rx_stop: None,
            rx_count: 0,
            tx_count: 0,
            tx_count_complete: 0,
            timeout_tx: 0,
            first_rx_lo: None,
            first_rx_relay: None,
            tally: RoundTally::default(),
        };

        match role {
            Role::Initiator => {
                // The record was checked above, so loading cannot fail
                if let Err(e) = round.machine.frame.load(&round.record, HEADER_ACTIVE) {
                    warn!("Initiator frame rejected: {}", e);
                }
                round.state = SlotState::Received;
                round.transmit(hw, false);
            }
            Role::Receiver => {
                hw.on();
                round.state = SlotState::Waiting;
            }
        }
        trace!(role = %role, max_tx, "round started");
        Ok(round)
    }
}

// ============================================================================
// Active Round
// ============================================================================

/// What a round leaves behind once stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Harvest {
    /// Local record, holding the union of everything received.
    pub record: FloodRecord,
    /// Valid receptions during the round (0 = heard nothing).
    pub reception_count: u16,
    /// Transmissions completed (relays and timeouts).
    pub transmissions: u8,
    /// Transmissions triggered by the backoff timeout.
    pub timeout_transmissions: u16,
    /// A complete bitmap was observed.
    pub complete: bool,
    /// Lo-resolution time of the first valid reception.
    pub first_rx_lo: Option<u64>,
    /// Relay counter carried by the first valid reception.
    pub first_rx_relay: Option<u8>,
    /// State at the moment of stopping.
    pub final_state: SlotState,
    /// Anomalies seen during the round.
    pub tally: RoundTally,
}

/// A running flood round.
#[derive(Debug)]
pub struct ActiveRound {
    machine: SlotMachine,
    record: FloodRecord,
    role: Role,
    max_tx: u8,
    state: SlotState,
    compare: Option<ComparePurpose>,
    suspended_backoff: Option<u64>,
    force_relay: bool,
    estimate_length: bool,
    complete: bool,
    timeout_pending: bool,

    rx_start: u64,
    rx_stop: u64,
    tx_start: u64,
    tx_stop: u64,
    tx_relay_last: u8,
    relay_timeout: u8,
    /// End of the reception our last relay was triggered by.
    relay_rx_stop: Option<u64>,

    rx_count: u16,
    tx_count: u8,
    tx_count_complete: u8,
    timeout_tx: u16,
    first_rx_lo: Option<u64>,
    first_rx_relay: Option<u8>,
    tally: RoundTally,
}

impl ActiveRound {
    pub fn state(&self) -> SlotState {
        self.state
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Local record as merged so far.
    pub fn record(&self) -> &FloodRecord {
        &self.record
    }

    pub fn reception_count(&self) -> u16 {
        self.rx_count
    }

    pub fn transmissions(&self) -> u8 {
        self.tx_count
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn first_rx_lo(&self) -> Option<u64> {
        self.first_rx_lo
    }

    pub fn first_rx_relay(&self) -> Option<u8> {
        self.first_rx_relay
    }

    pub fn sync(&self) -> &SyncEstimate {
        &self.machine.sync
    }

    pub fn slot_len(&self) -> Option<u64> {
        self.machine.sync.slot_len()
    }

    pub fn tally(&self) -> &RoundTally {
        &self.tally
    }

    /// Feed one radio or compare event into the state machine.
    pub fn handle<H: Hardware>(&mut self, event: RadioEvent<'_>, hw: &mut H) {
        if self.state == SlotState::Aborted {
            self.state = SlotState::Waiting;
            // The end of an aborted frame only resolves the abort
            if matches!(event, RadioEvent::FrameEnd { .. }) {
                return;
            }
        }

        match event {
            RadioEvent::FrameStart { at } => match self.state {
                SlotState::Waiting => self.begin_rx(at, hw),
                SlotState::Received => self.begin_tx(at, hw),
                state => trace!(?state, "frame start ignored"),
            },
            RadioEvent::FrameHeader { length, header } => {
                if self.state == SlotState::Receiving {
                    self.check_header(length, header, hw);
                }
            }
            RadioEvent::FrameEnd { at, frame } => match self.state {
                SlotState::Receiving => self.end_rx(at, frame, hw),
                SlotState::Transmitting => self.end_tx(at, hw),
                state => trace!(?state, "frame end ignored"),
            },
            RadioEvent::Compare { at } => self.on_compare(at, hw),
        }
    }

    /// Halt the radio and hand the machine and the record back.
    pub fn stop<H: Hardware>(mut self, hw: &mut H) -> (SlotMachine, Harvest) {
        hw.off();
        hw.cancel_compare();
        self.machine.backoff.cancel();

        let harvest = Harvest {
            record: self.record,
            reception_count: self.rx_count,
            transmissions: self.tx_count,
            timeout_transmissions: self.timeout_tx,
            complete: self.complete,
            first_rx_lo: self.first_rx_lo,
            first_rx_relay: self.first_rx_relay,
            final_state: self.state,
            tally: self.tally,
        };
        trace!(
            receptions = harvest.reception_count,
            transmissions = harvest.transmissions,
            state = ?harvest.final_state,
            "round stopped"
        );
        (self.machine, harvest)
    }

    // ------------------------------------------------------------------------
    // Reception
    // ------------------------------------------------------------------------

    fn begin_rx<H: Hardware>(&mut self, at: u64, hw: &mut H) {
        self.rx_start = at;
        self.state = SlotState::Receiving;
        self.force_relay = false;
        if self.compare == Some(ComparePurpose::Backoff) {
            self.suspended_backoff = self.machine.backoff.cancel();
        }
        self.arm(ComparePurpose::RxDeadline, at + self.machine.timing.rx_deadline_ticks, hw);
    }

    fn check_header<H: Hardware>(&mut self, length: u8, header: u8, hw: &mut H) {
        if let Err(e) = check_prefix(&self.machine.layout, length, header) {
            trace!("aborting reception: {}", e);
            self.abort_rx(Anomaly::MalformedFrame, hw);
            return;
        }
        let timing = &self.machine.timing;
        if timing.final_flood && self.complete && self.tx_count_complete < timing.n_tx_complete {
            self.force_relay = true;
        }
    }

    fn end_rx<H: Hardware>(&mut self, at: u64, bytes: &[u8], hw: &mut H) {
        self.disarm(hw);

        if let Err(e) = self.machine.frame.receive(bytes) {
            trace!("dropping frame: {}", e);
            self.drop_rx(Anomaly::MalformedFrame, hw);
            return;
        }
        if !self.machine.frame.footer().crc_ok() {
            self.drop_rx(Anomaly::CorruptFrame, hw);
            return;
        }

        // A valid reception stops the pending timeout for good
        self.suspended_backoff = None;

        let mask = self.machine.layout.completion_mask();
        let outcome = merge_flags(self.machine.frame.flags_mut(), &self.record.flags, mask);
        self.complete |= outcome.complete;
        let received_relay = self.machine.frame.relay_counter();

        let mut relay = outcome.relay() || self.force_relay;
        self.force_relay = false;

        let mut latency = 0;
        if relay {
            let target = at + self.machine.timing.processing_ticks;
            let now = hw.wait_until_hi(target);
            latency = now.saturating_sub(target);
            if latency > self.machine.timing.compensation_window_ticks {
                debug!(latency, "relay skipped, compensation window exceeded");
                self.tally.record(Anomaly::TimingOverrun);
                relay = false;
            }
        }

        if self.rx_count == 0 {
            self.first_rx_lo = Some(hw.now_lo());
            self.first_rx_relay = received_relay;
        }
        self.rx_count = self.rx_count.saturating_add(1);
        self.machine.frame.copy_record_into(&mut self.record);

        if !relay {
            hw.flush_rx();
            self.state = SlotState::Waiting;
            return;
        }

        if let Some(counter) = received_relay {
            self.machine.frame.set_relay_counter(counter.wrapping_add(1));
        }
        let relayed = self.tx_count < self.max_tx;
        if relayed {
            if self.complete {
                self.machine.frame.set_header(HEADER_FINAL);
            }
            hw.compensate(self.machine.timing.compensation_window_ticks - latency);
            self.transmit(hw, false);
        } else {
            self.power_down(hw);
        }

        if self.machine.timing.sync
            && self.estimate_length
            && self.machine.frame.header() == HEADER_ACTIVE
        {
            self.estimate_slot_length(at);
        }
        self.rx_stop = at;
        if relayed {
            self.relay_rx_stop = Some(at);
        }
        if self.complete {
            self.tx_count_complete = self.tx_count_complete.saturating_add(1);
        }
    }

    /// Sample the slot length if this frame is the neighbour's relay of our
    /// last transmission.
    ///
    /// Only a completed relay of ours counts: its triggering reception, its
    /// start and its end must all belong to this round.
    fn estimate_slot_length(&mut self, rx_end: u64) {
        let Some(counter) = self.machine.frame.relay_counter() else {
            return;
        };
        if self.tx_count == 0 || counter != self.tx_relay_last.wrapping_add(2) {
            return;
        }
        let Some(prev_rx_end) = self.relay_rx_stop else {
            return;
        };
        if prev_rx_end > self.tx_start || self.tx_start > self.tx_stop {
            return;
        }
        let slot = self.machine.sync.record_slot(&SlotTimestamps {
            prev_rx_end,
            tx_start: self.tx_start,
            tx_end: self.tx_stop,
            rx_start: self.rx_start,
            rx_end,
        });
        trace!(slot, counter, "slot length sampled");
        if self.machine.sync.estimator().windowed() {
            self.estimate_length = false;
        }
    }

    fn abort_rx<H: Hardware>(&mut self, anomaly: Anomaly, hw: &mut H) {
        self.tally.record(anomaly);
        self.disarm(hw);
        self.state = SlotState::Aborted;
        hw.flush_rx();
        self.resume_backoff(hw);
    }

    fn drop_rx<H: Hardware>(&mut self, anomaly: Anomaly, hw: &mut H) {
        self.tally.record(anomaly);
        self.state = SlotState::Waiting;
        hw.flush_rx();
        self.resume_backoff(hw);
    }

    // ------------------------------------------------------------------------
    // Transmission
    // ------------------------------------------------------------------------

    /// Hand the frame buffer to the radio and arm the next timeout.
    fn transmit<H: Hardware>(&mut self, hw: &mut H, timeout: bool) {
        hw.transmit(self.machine.frame.tx_bytes());
        self.state = SlotState::Received;
        self.timeout_pending = timeout;

        let now = hw.now_hi();
        let slot_len = self.machine.sync.slot_len();
        match self.machine.backoff.schedule(now, slot_len) {
            Some(deadline) => self.arm(ComparePurpose::Backoff, deadline, hw),
            None => self.disarm(hw),
        }
    }

    fn begin_tx<H: Hardware>(&mut self, at: u64, hw: &mut H) {
        self.tx_start = at;
        self.state = SlotState::Transmitting;

        let counter = self.machine.frame.relay_counter().unwrap_or(0);
        self.tx_relay_last = counter;
        self.relay_timeout = counter.wrapping_add(self.machine.backoff.n_slots());

        let sync = &mut self.machine.sync;
        if self.machine.timing.sync
            && !self.timeout_pending
            && self.rx_count > 0
            && !sync.is_updated()
            && sync.slot_len().is_some()
        {
            let capture = hw.capture_next_tick();
            if sync.compute_reference(counter, self.rx_start, capture, self.machine.timing.clock_phi) {
                debug!(
                    reference_lo = sync.reference_lo(),
                    relay_count = sync.relay_count(),
                    "reference time computed"
                );
            }
        }
    }

    fn end_tx<H: Hardware>(&mut self, at: u64, hw: &mut H) {
        self.tx_stop = at;
        self.tx_count = self.tx_count.saturating_add(1);
        if self.timeout_pending {
            self.timeout_tx = self.timeout_tx.saturating_add(1);
            self.timeout_pending = false;
        }

        let timing = &self.machine.timing;
        // A synchronizing initiator with a single transmission keeps listening
        // so it can still hear a relay and compute its reference time.
        let budget_spent = self.tx_count >= self.max_tx
            && !(timing.sync && self.role == Role::Initiator && self.max_tx == 1);
        let final_done =
            timing.final_flood && self.complete && self.tx_count_complete >= timing.n_tx_complete;

        if budget_spent || final_done {
            self.power_down(hw);
        } else {
            self.state = SlotState::Waiting;
        }
    }

    // ------------------------------------------------------------------------
    // Compare Channel
    // ------------------------------------------------------------------------

    fn on_compare<H: Hardware>(&mut self, at: u64, hw: &mut H) {
        match self.compare.take() {
            Some(ComparePurpose::RxDeadline) if self.state == SlotState::Receiving => {
                self.abort_rx(Anomaly::ReceptionTimeout, hw);
            }
            Some(ComparePurpose::Backoff) => {
                if !self.machine.backoff.expire(at) {
                    return;
                }
                if self.state == SlotState::Waiting {
                    self.timeout_transmit(hw);
                }
            }
            purpose => trace!(?purpose, state = ?self.state, "stale compare"),
        }
    }

    /// Nothing heard for the backoff duration: transmit our own record.
    fn timeout_transmit<H: Hardware>(&mut self, hw: &mut H) {
        let header = if self.role == Role::Initiator && self.rx_count == 0 {
            HEADER_ACTIVE
        } else {
            self.estimate_length = false;
            HEADER_FINAL
        };
        if let Err(e) = self.machine.frame.load(&self.record, header) {
            warn!("Timeout transmission dropped: {}", e);
            return;
        }
        self.machine.frame.set_relay_counter(self.relay_timeout);
        self.relay_rx_stop = None;
        trace!(relay_counter = self.relay_timeout, header, "timeout transmission");
        hw.flush_rx();
        self.transmit(hw, true);
    }

    fn arm<H: Hardware>(&mut self, purpose: ComparePurpose, at: u64, hw: &mut H) {
        hw.arm_compare(at);
        self.compare = Some(purpose);
    }

    fn disarm<H: Hardware>(&mut self, hw: &mut H) {
        if self.compare.take().is_some() {
            hw.cancel_compare();
        }
    }

    /// Re-arm a backoff suspended by a failed reception.
    ///
    /// A failed reception resumes the pending timeout instead of cancelling
    /// it; only a valid reception drops it.
    fn resume_backoff<H: Hardware>(&mut self, hw: &mut H) {
        if let Some(deadline) = self.suspended_backoff.take() {
            let at = deadline.max(hw.now_hi());
            self.machine.backoff.resume(at);
            self.arm(ComparePurpose::Backoff, at, hw);
        }
    }

    fn power_down<H: Hardware>(&mut self, hw: &mut H) {
        hw.off();
        self.disarm(hw);
        self.machine.backoff.cancel();
        self.suspended_backoff = None;
        self.state = SlotState::Off;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{frame_bytes, MockHardware};

    fn config() -> ChaosConfig {
        ChaosConfig {
            participants: 3,
            payload_len: 2,
            ..Default::default()
        }
    }

    fn record(index: u16) -> FloodRecord {
        let layout = config().layout().unwrap();
        let mut record = FloodRecord::new(&layout);
        record.set_own_contribution(index);
        record
    }

    fn receiver(hw: &mut MockHardware, index: u16) -> ActiveRound {
        let machine = SlotMachine::new(&config(), 7).unwrap();
        machine
            .start(record(index), Role::Receiver, 255, hw)
            .unwrap()
    }

    /// Deliver a complete reception starting at `at`.
    fn deliver(round: &mut ActiveRound, hw: &mut MockHardware, at: u64, bytes: &[u8]) {
        round.handle(RadioEvent::FrameStart { at }, hw);
        round.handle(
            RadioEvent::FrameHeader {
                length: bytes[0],
                header: bytes[1],
            },
            hw,
        );
        let end = at + 1_500;
        hw.now_hi = end;
        round.handle(RadioEvent::FrameEnd { at: end, frame: bytes }, hw);
    }

    #[test]
    fn test_initiator_transmits_immediately() {
        let mut hw = MockHardware::default();
        let mut initiator = record(0);
        initiator.seq_no = 1;
        let machine = SlotMachine::new(&config(), 1).unwrap();
        let mut round = machine.start(initiator, Role::Initiator, 255, &mut hw).unwrap();

        assert_eq!(round.state(), SlotState::Received);
        assert_eq!(hw.transmitted.len(), 1);
        let sent = &hw.transmitted[0];
        assert_eq!(sent[1], HEADER_ACTIVE);
        assert_eq!(sent[2], 0);
        // No slot estimate yet, so no timeout is armed
        assert_eq!(hw.compare, None);

        round.handle(RadioEvent::FrameStart { at: 100 }, &mut hw);
        assert_eq!(round.state(), SlotState::Transmitting);
        round.handle(RadioEvent::FrameEnd { at: 1_600, frame: &[] }, &mut hw);
        assert_eq!(round.state(), SlotState::Waiting);
        assert_eq!(round.transmissions(), 1);
    }

    #[test]
    fn test_receiver_merges_and_relays() {
        let mut hw = MockHardware::default();
        let mut round = receiver(&mut hw, 1);
        assert!(hw.radio_on);
        assert_eq!(round.state(), SlotState::Waiting);

        let mut incoming = record(0);
        incoming.seq_no = 1;
        let bytes = frame_bytes(&config(), &incoming, HEADER_ACTIVE, 0, true);
        deliver(&mut round, &mut hw, 10_000, &bytes);

        assert_eq!(round.state(), SlotState::Received);
        assert_eq!(round.reception_count(), 1);
        assert_eq!(round.record().flags, vec![0b011]);
        assert_eq!(round.record().seq_no, 1);
        assert_eq!(round.first_rx_relay(), Some(0));

        let relayed = hw.transmitted.last().unwrap();
        assert_eq!(relayed[1], HEADER_ACTIVE);
        assert_eq!(relayed[2], 1);
        assert_eq!(relayed[7], 0b011);
        // Relay issued exactly at end of frame + processing + compensation
        assert_eq!(hw.tx_times[0], 11_500 + 40_000 + 17);
    }

    #[test]
    fn test_identical_frame_is_counted_not_relayed() {
        let mut hw = MockHardware::default();
        let mut round = receiver(&mut hw, 1);
        let mut incoming = record(0);
        incoming.flags = vec![0b010];
        let bytes = frame_bytes(&config(), &incoming, HEADER_ACTIVE, 3, true);
        deliver(&mut round, &mut hw, 5_000, &bytes);

        assert_eq!(round.state(), SlotState::Waiting);
        assert_eq!(round.reception_count(), 1);
        assert!(hw.transmitted.is_empty());
    }

    #[test]
    fn test_bad_header_aborts_reception() {
        let mut hw = MockHardware::default();
        let mut round = receiver(&mut hw, 1);

        round.handle(RadioEvent::FrameStart { at: 100 }, &mut hw);
        round.handle(RadioEvent::FrameHeader { length: 11, header: 0x10 }, &mut hw);
        assert_eq!(round.state(), SlotState::Aborted);
        assert_eq!(round.tally().malformed, 1);
        assert_eq!(hw.compare, None);

        // The tail of the aborted frame only resolves the abort
        round.handle(RadioEvent::FrameEnd { at: 2_000, frame: &[] }, &mut hw);
        assert_eq!(round.state(), SlotState::Waiting);
        assert_eq!(round.reception_count(), 0);
    }

    #[test]
    fn test_wrong_length_aborts_reception() {
        let mut hw = MockHardware::default();
        let mut round = receiver(&mut hw, 1);
        round.handle(RadioEvent::FrameStart { at: 100 }, &mut hw);
        round.handle(RadioEvent::FrameHeader { length: 12, header: HEADER_ACTIVE }, &mut hw);
        assert_eq!(round.state(), SlotState::Aborted);

        // Any other event resolves the abort and is then processed
        round.handle(RadioEvent::FrameStart { at: 9_000 }, &mut hw);
        assert_eq!(round.state(), SlotState::Receiving);
    }

    #[test]
    fn test_corrupt_frame_dropped() {
        let mut hw = MockHardware::default();
        let mut round = receiver(&mut hw, 1);
        let bytes = frame_bytes(&config(), &record(0), HEADER_ACTIVE, 0, false);
        deliver(&mut round, &mut hw, 100, &bytes);

        assert_eq!(round.state(), SlotState::Waiting);
        assert_eq!(round.tally().corrupt, 1);
        assert_eq!(round.reception_count(), 0);
        assert_eq!(round.record().flags, vec![0b010]);
        assert!(hw.transmitted.is_empty());
    }

    #[test]
    fn test_reception_deadline() {
        let mut hw = MockHardware::default();
        let mut round = receiver(&mut hw, 1);
        round.handle(RadioEvent::FrameStart { at: 1_000 }, &mut hw);
        let deadline = 1_000 + (11 * 35 + 200) * 4;
        assert_eq!(hw.compare, Some(deadline));

        round.handle(RadioEvent::Compare { at: deadline }, &mut hw);
        assert_eq!(round.state(), SlotState::Aborted);
        assert_eq!(round.tally().rx_timeouts, 1);
    }

    #[test]
    fn test_timing_overrun_skips_relay() {
        let mut hw = MockHardware {
            latency: 100,
            ..Default::default()
        };
        let mut round = receiver(&mut hw, 2);
        let bytes = frame_bytes(&config(), &record(0), HEADER_ACTIVE, 0, true);
        deliver(&mut round, &mut hw, 100, &bytes);

        assert_eq!(round.tally().timing_overruns, 1);
        assert_eq!(round.state(), SlotState::Waiting);
        assert!(hw.transmitted.is_empty());
        // The merge is still kept locally
        assert_eq!(round.record().flags, vec![0b101]);
    }

    #[test]
    fn test_slot_not_sampled_before_own_relay() {
        let mut hw = MockHardware {
            latency: 100,
            ..Default::default()
        };
        let mut round = receiver(&mut hw, 2);
        let bytes = frame_bytes(&config(), &record(0), HEADER_ACTIVE, 0, true);
        deliver(&mut round, &mut hw, 100, &bytes);
        assert_eq!(round.tally().timing_overruns, 1);
        assert_eq!(round.reception_count(), 1);

        // Relayable frame whose relayed counter matches `tx_relay_last + 2`,
        // yet nothing of ours was ever on the air
        hw.latency = 0;
        let bytes = frame_bytes(&config(), &record(0), HEADER_ACTIVE, 1, true);
        let rx2 = 200_000;
        deliver(&mut round, &mut hw, rx2, &bytes);
        assert_eq!(hw.transmitted.len(), 1);
        assert_eq!(hw.transmitted[0][2], 2);
        assert_eq!(round.slot_len(), None);

        let tx_start = hw.now_hi;
        round.handle(RadioEvent::FrameStart { at: tx_start }, &mut hw);
        round.handle(RadioEvent::FrameEnd { at: tx_start + 1_500, frame: &[] }, &mut hw);
        assert_eq!(round.slot_len(), None);

        // The neighbour's relay of our frame is the first valid sample
        let rx3 = tx_start + 1_500 + 40_017;
        let bytes = frame_bytes(&config(), &record(0), HEADER_ACTIVE, 3, true);
        deliver(&mut round, &mut hw, rx3, &bytes);
        let expected = SlotTimestamps {
            prev_rx_end: rx2 + 1_500,
            tx_start,
            tx_end: tx_start + 1_500,
            rx_start: rx3,
            rx_end: rx3 + 1_500,
        }
        .slot_sample();
        assert_eq!(round.slot_len(), Some(expected));
        assert!(expected < 50_000);
    }

    #[test]
    fn test_complete_bitmap_relayed_with_final_header() {
        let mut hw = MockHardware::default();
        let mut round = receiver(&mut hw, 2);
        let mut incoming = record(0);
        incoming.flags = vec![0b011];
        let bytes = frame_bytes(&config(), &incoming, HEADER_ACTIVE, 4, true);
        deliver(&mut round, &mut hw, 100, &bytes);

        assert!(round.is_complete());
        let relayed = hw.transmitted.last().unwrap();
        assert_eq!(relayed[1], HEADER_FINAL);
        assert_eq!(relayed[2], 5);
        assert_eq!(relayed[7], 0b111);
    }

    #[test]
    fn test_final_flood_forces_relay_then_stops() {
        let mut hw = MockHardware::default();
        let mut round = receiver(&mut hw, 2);
        let mut complete = record(0);
        complete.flags = vec![0b111];

        let mut at = 100;
        for n in 0..5u8 {
            let bytes = frame_bytes(&config(), &complete, HEADER_FINAL, n * 2, true);
            deliver(&mut round, &mut hw, at, &bytes);
            assert_eq!(round.state(), SlotState::Received, "relay {n}");
            round.handle(RadioEvent::FrameStart { at: hw.now_hi }, &mut hw);
            round.handle(RadioEvent::FrameEnd { at: hw.now_hi + 1_500, frame: &[] }, &mut hw);
            at = hw.now_hi + 10_000;
        }
        // Five complete receptions relayed: the node is done
        assert_eq!(round.state(), SlotState::Off);
        assert_eq!(hw.transmitted.len(), 5);
        assert!(!hw.radio_on);
    }

    #[test]
    fn test_transmission_budget() {
        let mut hw = MockHardware::default();
        let machine = SlotMachine::new(&config(), 7).unwrap();
        let mut round = machine.start(record(1), Role::Receiver, 1, &mut hw).unwrap();

        let bytes = frame_bytes(&config(), &record(0), HEADER_ACTIVE, 0, true);
        deliver(&mut round, &mut hw, 100, &bytes);
        round.handle(RadioEvent::FrameStart { at: hw.now_hi }, &mut hw);
        round.handle(RadioEvent::FrameEnd { at: hw.now_hi + 1_500, frame: &[] }, &mut hw);
        assert_eq!(round.state(), SlotState::Off);
        assert_eq!(round.transmissions(), 1);
    }

    fn single_shot_initiator(hw: &mut MockHardware, sync: bool) -> ActiveRound {
        let config = ChaosConfig { sync, ..config() };
        let machine = SlotMachine::new(&config, 5).unwrap();
        let mut round = machine.start(record(0), Role::Initiator, 1, hw).unwrap();
        round.handle(RadioEvent::FrameStart { at: 100 }, hw);
        round.handle(RadioEvent::FrameEnd { at: 1_600, frame: &[] }, hw);
        round
    }

    #[test]
    fn test_synchronizing_initiator_listens_after_single_transmission() {
        let mut hw = MockHardware::default();
        let mut round = single_shot_initiator(&mut hw, true);
        assert_eq!(round.transmissions(), 1);
        assert_eq!(round.state(), SlotState::Waiting);

        // The neighbour's relay is still received and merged
        let bytes = frame_bytes(&config(), &record(1), HEADER_ACTIVE, 1, true);
        deliver(&mut round, &mut hw, 45_000, &bytes);
        assert_eq!(round.reception_count(), 1);
        assert_eq!(round.first_rx_relay(), Some(1));
        assert_eq!(round.record().flags, vec![0b011]);
        // Budget spent: no relay, and no sample without a triggering reception
        assert_eq!(hw.transmitted.len(), 1);
        assert_eq!(round.state(), SlotState::Off);
        assert_eq!(round.slot_len(), None);
    }

    #[test]
    fn test_initiator_without_sync_stops_after_single_transmission() {
        let mut hw = MockHardware::default();
        let round = single_shot_initiator(&mut hw, false);
        assert_eq!(round.transmissions(), 1);
        assert_eq!(round.state(), SlotState::Off);
        assert!(!hw.radio_on);
        assert_eq!(hw.compare, None);
    }

    #[test]
    fn test_timeout_transmission() {
        let mut hw = MockHardware::default();
        let mut machine = SlotMachine::new(&config(), 3).unwrap();
        machine.sync_mut().record_slot(&SlotTimestamps {
            rx_end: 2 * 50_000,
            ..Default::default()
        });
        let mut round = machine.start(record(0), Role::Initiator, 255, &mut hw).unwrap();
        let deadline = hw.compare.unwrap();
        let n_slots = deadline / 50_000;
        assert!((3..=7).contains(&n_slots));

        round.handle(RadioEvent::FrameStart { at: 10 }, &mut hw);
        round.handle(RadioEvent::FrameEnd { at: 1_500, frame: &[] }, &mut hw);
        hw.now_hi = deadline;
        round.handle(RadioEvent::Compare { at: deadline }, &mut hw);

        assert_eq!(round.state(), SlotState::Received);
        assert_eq!(hw.transmitted.len(), 2);
        let sent = &hw.transmitted[1];
        // Initiator that heard nothing keeps the active header
        assert_eq!(sent[1], HEADER_ACTIVE);
        assert_eq!(sent[2] as u64, n_slots);

        round.handle(RadioEvent::FrameStart { at: deadline + 10 }, &mut hw);
        round.handle(RadioEvent::FrameEnd { at: deadline + 1_500, frame: &[] }, &mut hw);
        let (_, harvest) = round.stop(&mut hw);
        assert_eq!(harvest.timeout_transmissions, 1);
        assert_eq!(harvest.transmissions, 2);
    }

    #[test]
    fn test_backoff_suspended_during_reception() {
        let mut hw = MockHardware::default();
        let mut machine = SlotMachine::new(&config(), 3).unwrap();
        machine.sync_mut().record_slot(&SlotTimestamps {
            rx_end: 2 * 50_000,
            ..Default::default()
        });
        let mut round = machine.start(record(0), Role::Initiator, 255, &mut hw).unwrap();
        let deadline = hw.compare.unwrap();
        round.handle(RadioEvent::FrameStart { at: 10 }, &mut hw);
        round.handle(RadioEvent::FrameEnd { at: 1_500, frame: &[] }, &mut hw);

        // Corrupted reception: the backoff comes back
        let bytes = frame_bytes(&config(), &record(1), HEADER_ACTIVE, 1, false);
        deliver(&mut round, &mut hw, 60_000, &bytes);
        assert_eq!(hw.compare, Some(deadline));

        // Valid reception: the backoff is gone and a relay re-arms it
        let bytes = frame_bytes(&config(), &record(1), HEADER_ACTIVE, 1, true);
        deliver(&mut round, &mut hw, 70_000, &bytes);
        assert_eq!(round.state(), SlotState::Received);
        assert!(hw.compare.unwrap() > hw.now_hi);
    }

    #[test]
    fn test_reference_computed_on_first_relay() {
        let mut hw = MockHardware::default();
        let mut machine = SlotMachine::new(&config(), 3).unwrap();
        machine.sync_mut().record_slot(&SlotTimestamps {
            rx_end: 2 * 51_200,
            ..Default::default()
        });
        let mut round = machine.start(record(2), Role::Receiver, 255, &mut hw).unwrap();

        let rx_start = 1_000_000;
        let bytes = frame_bytes(&config(), &record(0), HEADER_ACTIVE, 2, true);
        deliver(&mut round, &mut hw, rx_start, &bytes);
        assert!(!round.sync().is_updated());

        round.handle(RadioEvent::FrameStart { at: hw.now_hi }, &mut hw);
        let sync = round.sync();
        assert!(sync.is_updated());
        assert_eq!(sync.relay_count(), 2);
        // Flood started two slots before the reception
        let expected = (rx_start - 2 * 51_200) / 128;
        assert!(sync.reference_lo().abs_diff(expected) <= 1);
    }

    #[test]
    fn test_slot_length_sampled_from_neighbour_relay() {
        let mut hw = MockHardware::default();
        let mut round = receiver(&mut hw, 1);

        // First reception (counter 0), relayed with counter 1
        let bytes = frame_bytes(&config(), &record(0), HEADER_ACTIVE, 0, true);
        deliver(&mut round, &mut hw, 0, &bytes);
        let tx_start = hw.now_hi;
        round.handle(RadioEvent::FrameStart { at: tx_start }, &mut hw);
        round.handle(RadioEvent::FrameEnd { at: tx_start + 1_500, frame: &[] }, &mut hw);
        assert!(round.slot_len().is_none());

        // Neighbour relays our frame with counter 2, still missing our bit
        let bytes = frame_bytes(&config(), &record(0), HEADER_ACTIVE, 2, true);
        let rx_start = tx_start + 1_500 + 40_017;
        deliver(&mut round, &mut hw, rx_start, &bytes);

        let expected = SlotTimestamps {
            prev_rx_end: 1_500,
            tx_start,
            tx_end: tx_start + 1_500,
            rx_start,
            rx_end: rx_start + 1_500,
        }
        .slot_sample();
        assert_eq!(round.slot_len(), Some(expected));
    }

    #[test]
    fn test_stop_returns_record_and_powers_down() {
        let mut hw = MockHardware::default();
        let mut round = receiver(&mut hw, 1);
        let bytes = frame_bytes(&config(), &record(0), HEADER_ACTIVE, 0, true);
        deliver(&mut round, &mut hw, 100, &bytes);
        round.handle(RadioEvent::FrameStart { at: 50_000 }, &mut hw);

        let (machine, harvest) = round.stop(&mut hw);
        assert!(!hw.radio_on);
        assert_eq!(hw.compare, None);
        assert_eq!(harvest.reception_count, 1);
        assert_eq!(harvest.final_state, SlotState::Transmitting);
        assert_eq!(harvest.record.flags, vec![0b011]);
        assert_eq!(machine.layout().participants(), 3);
    }

    #[test]
    fn test_start_rejects_mis_sized_record() {
        let mut hw = MockHardware::default();
        let machine = SlotMachine::new(&config(), 1).unwrap();
        let bad = FloodRecord {
            seq_no: 1,
            flags: vec![0, 0],
            payload: vec![0; 2],
        };
        let err = machine.start(bad, Role::Initiator, 1, &mut hw).unwrap_err();
        assert!(matches!(err.source, PacketError::FieldSize { field: "flags", .. }));
        assert_eq!(err.record.seq_no, 1);
        assert!(hw.transmitted.is_empty());
    }
}
