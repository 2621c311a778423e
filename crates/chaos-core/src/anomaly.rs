//! In-round anomalies.
//!
//! None of these are errors: each one costs at most a slot and the state
//! machine returns to a well-defined state. They are counted per round and
//! surfaced through the round report and metrics.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Something that went wrong during a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Anomaly {
    /// Wrong length or header byte.
    MalformedFrame,
    /// Radio reported a bad CRC.
    CorruptFrame,
    /// Relay compensation window exceeded; the relay was skipped.
    TimingOverrun,
    /// The frame did not complete within the reception deadline.
    ReceptionTimeout,
}

impl Anomaly {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Anomaly::MalformedFrame => "malformed_frame",
            Anomaly::CorruptFrame => "corrupt_frame",
            Anomaly::TimingOverrun => "timing_overrun",
            Anomaly::ReceptionTimeout => "reception_timeout",
        }
    }
}

impl fmt::Display for Anomaly {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Anomaly counts of one round (or, summed, of many).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundTally {
    pub malformed: u32,
    pub corrupt: u32,
    pub timing_overruns: u32,
    pub rx_timeouts: u32,
}

impl RoundTally {
    pub fn record(&mut self, anomaly: Anomaly) {
        match anomaly {
            Anomaly::MalformedFrame => self.malformed += 1,
            Anomaly::CorruptFrame => self.corrupt += 1,
            Anomaly::TimingOverrun => self.timing_overruns += 1,
            Anomaly::ReceptionTimeout => self.rx_timeouts += 1,
        }
    }

    pub fn count(&self, anomaly: Anomaly) -> u32 {
        match anomaly {
            Anomaly::MalformedFrame => self.malformed,
            Anomaly::CorruptFrame => self.corrupt,
            Anomaly::TimingOverrun => self.timing_overruns,
            Anomaly::ReceptionTimeout => self.rx_timeouts,
        }
    }

    pub fn total(&self) -> u32 {
        self.malformed + self.corrupt + self.timing_overruns + self.rx_timeouts
    }

    /// Add another tally into this one.
    pub fn absorb(&mut self, other: &RoundTally) {
        self.malformed += other.malformed;
        self.corrupt += other.corrupt;
        self.timing_overruns += other.timing_overruns;
        self.rx_timeouts += other.rx_timeouts;
    }
}
