//! Error types for chaos-core.

use chaos_packet::PacketError;
use thiserror::Error;

/// Errors raised while validating a [`crate::ChaosConfig`] or deriving node parameters.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The record layout does not fit a radio frame.
    #[error("Invalid record layout: {0}")]
    Layout(#[from] PacketError),

    /// Backoff range is empty.
    #[error("Backoff range is empty: min_slots {min} > max_slots {max}")]
    BackoffRange {
        /// Configured minimum.
        min: u8,
        /// Configured maximum.
        max: u8,
    },

    /// Backoff shorter than two slots collides with the ongoing relay chain.
    #[error("min_slots must be at least 2 (got {0})")]
    BackoffTooShort(u8),

    /// The transmission budget is zero.
    #[error("n_tx must be at least 1")]
    NoTransmissions,

    /// A timing parameter that must be non-zero is zero.
    #[error("`{0}` must be non-zero")]
    ZeroTiming(&'static str),

    /// A derived timing value does not fit in 64 bits.
    #[error("`{0}` overflows")]
    TimingOverflow(&'static str),

    /// A round does not fit inside its period.
    #[error("{what} duration {duration} does not fit in period {period}")]
    DurationTooLong {
        /// Which schedule is affected ("round" or "bootstrap").
        what: &'static str,
        /// Round duration in low-resolution ticks.
        duration: u64,
        /// Period in low-resolution ticks.
        period: u64,
    },

    /// The node identifier has no contribution index.
    #[error("Node id {0} has no contribution index")]
    UnmappedNode(u16),

    /// The mapped index lies outside the bitmap.
    #[error("Node id {id} maps to index {index}, but only {participants} participants are configured")]
    IndexOutOfRange {
        /// Node identifier.
        id: u16,
        /// Derived index.
        index: u16,
        /// Configured participant count.
        participants: u16,
    },
}

impl ConfigError {
    /// Create a duration error.
    pub fn duration(what: &'static str, duration: u64, period: u64) -> Self {
        ConfigError::DurationTooLong {
            what,
            duration,
            period,
        }
    }
}
