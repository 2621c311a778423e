//! # chaos-core
//!
//! The Chaos all-to-all flooding protocol: slot state machine, timeout/backoff,
//! clock synchronization and round scheduling.
//!
//! ## Components
//!
//! - **Slot state machine** ([`SlotMachine`], [`ActiveRound`]): receives,
//!   merges and relays the shared record with bounded relay latency.
//! - **Timeout/backoff** ([`Backoff`]): transmits after a random number of
//!   silent slots so a lossy hop cannot stall the flood.
//! - **Synchronization** ([`SyncEstimate`]): slot length and reference time,
//!   derived from relay counters and local timestamps.
//! - **Round scheduler** ([`RoundScheduler`]): bootstrap and steady-state
//!   round timing with skew compensation.
//!
//! The platform plugs in through [`Radio`], [`Clock`] and [`RoundTimer`].

mod anomaly;
mod backoff;
mod config;
mod error;
mod radio;
mod scheduler;
mod slot;
mod sync;

#[cfg(test)]
mod testing;

pub use anomaly::{Anomaly, RoundTally};
pub use backoff::Backoff;
pub use config::{ChaosConfig, NodeIndexMapping, LO_TICKS_PER_SECOND};
pub use error::ConfigError;
pub use radio::{Clock, Hardware, Radio, RadioEvent, RoundTimer};
pub use scheduler::{
    InitiatorStep, PayloadFn, Phase, ReceiverStep, RoundContext, RoundReport, RoundScheduler,
    RoundStep,
};
pub use slot::{ActiveRound, Harvest, Role, SlotMachine, SlotState, StartError};
pub use sync::{SlotEstimator, SlotTimestamps, SyncEstimate};

// Re-exported so platforms only need one dependency
pub use chaos_packet::{FloodRecord, RecordLayout};
