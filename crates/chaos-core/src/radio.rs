//! Hardware seams: radio, clocks and the round timer.
//!
//! The slot state machine never talks to a radio chip or a timer peripheral
//! directly. A platform (or the simulator) implements [`Radio`] and [`Clock`]
//! and feeds [`RadioEvent`]s into the machine from its interrupt context.

/// Radio transceiver operations used during a round.
pub trait Radio {
    /// Enter receive mode.
    fn on(&mut self);

    /// Turn the transceiver off, abandoning any reception or transmission.
    fn off(&mut self);

    /// Start transmitting `frame` (length byte through record, no footer) now.
    fn transmit(&mut self, frame: &[u8]);

    /// Discard the remainder of the frame being received.
    fn flush_rx(&mut self);
}

/// Clock and compare-channel operations used during a round.
pub trait Clock {
    /// Current high-resolution time.
    fn now_hi(&self) -> u64;

    /// Current low-resolution time.
    fn now_lo(&self) -> u64;

    /// Wait for the next low-resolution tick and return `(hi, lo)` at that edge.
    fn capture_next_tick(&mut self) -> (u64, u64);

    /// Busy-wait until `target` and return the time at which the wait ended.
    ///
    /// The returned value may exceed `target` by the service latency of the
    /// platform; [`Clock::compensate`] absorbs that difference.
    fn wait_until_hi(&mut self, target: u64) -> u64;

    /// Deterministic-latency delay of exactly `ticks` high-resolution ticks.
    fn compensate(&mut self, ticks: u64);

    /// Arm the single compare channel at `at` (replaces any armed compare).
    fn arm_compare(&mut self, at: u64);

    /// Disarm the compare channel.
    fn cancel_compare(&mut self);
}

/// Everything the slot state machine needs from the platform.
pub trait Hardware: Radio + Clock {}

impl<T: Radio + Clock> Hardware for T {}

/// Low-resolution timer driving the round scheduler.
pub trait RoundTimer {
    /// Invoke the scheduler again at low-resolution time `at`.
    fn schedule_at(&mut self, at: u64);
}

/// Event delivered from the radio interrupt context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadioEvent<'a> {
    /// Start-of-frame delimiter detected (reception or own transmission).
    FrameStart {
        /// Captured high-resolution time of the edge.
        at: u64,
    },
    /// Length and header bytes of an incoming frame are available.
    FrameHeader {
        /// Length byte.
        length: u8,
        /// Header byte.
        header: u8,
    },
    /// End of frame (reception or own transmission).
    FrameEnd {
        /// Captured high-resolution time of the edge.
        at: u64,
        /// Received bytes including the footer (empty for own transmissions).
        frame: &'a [u8],
    },
    /// The compare channel fired.
    Compare {
        /// High-resolution time of the compare.
        at: u64,
    },
}
