//! Network-wide Chaos configuration.
//!
//! All nodes of a network must run with the same configuration. Times are
//! expressed in two units:
//!
//! - *hi* ticks: the high-resolution clock used for relay timing and slot
//!   estimation (about 4.19 MHz on the reference platform).
//! - *lo* ticks: the low-resolution clock used for round scheduling
//!   (32768 Hz), `clock_phi` hi ticks per lo tick.

use crate::ConfigError;
use chaos_packet::RecordLayout;
use serde::{Deserialize, Serialize};

/// Low-resolution clock frequency.
pub const LO_TICKS_PER_SECOND: u64 = 32_768;

/// How a node identifier is turned into a contribution index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeIndexMapping {
    /// `index = id - base`.
    Offset {
        /// Identifier of the node owning index 0.
        base: u16,
    },
    /// `index` = position of `id` in `ids`.
    Table {
        /// Node identifiers, in index order.
        ids: Vec<u16>,
    },
}

impl Default for NodeIndexMapping {
    fn default() -> Self {
        NodeIndexMapping::Offset { base: 1 }
    }
}

/// Chaos protocol configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChaosConfig {
    /// Number of participants (bits in the contribution bitmap).
    pub participants: u16,
    /// Application payload length in bytes.
    pub payload_len: usize,
    /// Carry a relay counter and derive time synchronization from relays.
    pub sync: bool,
    /// Keep relaying for a few receptions after the bitmap is complete.
    pub final_flood: bool,
    /// Transmit on our own after a random number of silent slots.
    pub timeout: bool,

    /// Maximum transmissions per round (`N_TX`).
    pub n_tx: u8,
    /// Complete receptions relayed before stopping in the final flood.
    pub n_tx_complete: u8,
    /// Lower bound of the backoff draw, in slots.
    pub min_slots: u8,
    /// Upper bound of the backoff draw, in slots.
    pub max_slots: u8,
    /// Slot length averaging window (0 = use every sample directly).
    pub sync_window: u32,

    /// Hi ticks between the end of a reception and the relay decision point.
    pub processing_ticks: u64,
    /// Largest service latency, in hi ticks, that can still be absorbed before a relay.
    pub compensation_window_ticks: u64,
    /// Reception deadline: hi ticks allowed per byte of `PACKET_LEN`.
    pub rx_ticks_per_byte: u64,
    /// Reception deadline: fixed slack in hi ticks.
    pub rx_slack_ticks: u64,
    /// Hi ticks per lo tick.
    pub clock_phi: u64,

    /// Round period in lo ticks.
    pub period: u64,
    /// Flooding phase duration in lo ticks.
    pub duration: u64,
    /// Guard time before an expected round, in lo ticks.
    pub guard: u64,
    /// Guard time used while bootstrapping, in lo ticks.
    pub bootstrap_guard: u64,
    /// Off time between bootstrap listening phases, in lo ticks.
    pub bootstrap_gap: u64,
    /// Consecutive synchronized rounds required to leave bootstrap.
    pub bootstrap_periods: u8,

    /// Node identifier to contribution index mapping.
    pub node_mapping: NodeIndexMapping,
}

impl Default for ChaosConfig {
    fn default() -> Self {
        ChaosConfig {
            participants: 3,
            payload_len: 100,
            sync: true,
            final_flood: true,
            timeout: true,
            n_tx: 255,
            n_tx_complete: 5,
            min_slots: 3,
            max_slots: 7,
            sync_window: 32,
            processing_ticks: 40_000,
            compensation_window_ticks: 17,
            rx_ticks_per_byte: 35 * 4,
            rx_slack_ticks: 200 * 4,
            clock_phi: 4_194_304 / LO_TICKS_PER_SECOND,
            period: LO_TICKS_PER_SECOND * 2,
            duration: LO_TICKS_PER_SECOND / 2,
            guard: LO_TICKS_PER_SECOND / 1000,
            bootstrap_guard: LO_TICKS_PER_SECOND / 20,
            bootstrap_gap: LO_TICKS_PER_SECOND / 100,
            bootstrap_periods: 3,
            node_mapping: NodeIndexMapping::default(),
        }
    }
}

impl ChaosConfig {
    /// Check the configuration for inconsistencies.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.layout()?;
        if self.min_slots < 2 {
            return Err(ConfigError::BackoffTooShort(self.min_slots));
        }
        if self.min_slots > self.max_slots {
            return Err(ConfigError::BackoffRange {
                min: self.min_slots,
                max: self.max_slots,
            });
        }
        if self.n_tx == 0 {
            return Err(ConfigError::NoTransmissions);
        }
        for (name, value) in [
            ("clock_phi", self.clock_phi),
            ("period", self.period),
            ("duration", self.duration),
            ("processing_ticks", self.processing_ticks),
        ] {
            if value == 0 {
                return Err(ConfigError::ZeroTiming(name));
            }
        }
        let round = self
            .duration
            .checked_add(self.guard)
            .ok_or(ConfigError::TimingOverflow("duration + guard"))?;
        if round >= self.period {
            return Err(ConfigError::duration("round", self.duration, self.period));
        }
        self.duration
            .checked_add(self.bootstrap_guard)
            .and_then(|listen| listen.checked_add(self.bootstrap_gap))
            .ok_or(ConfigError::TimingOverflow("bootstrap period"))?;
        (self.layout()?.packet_len() as u64)
            .checked_mul(self.rx_ticks_per_byte)
            .and_then(|ticks| ticks.checked_add(self.rx_slack_ticks))
            .ok_or(ConfigError::TimingOverflow("reception deadline"))?;
        if self.bootstrap_duration() >= self.period {
            return Err(ConfigError::duration(
                "bootstrap",
                self.bootstrap_duration(),
                self.period,
            ));
        }
        if let NodeIndexMapping::Table { ids } = &self.node_mapping {
            if ids.len() > self.participants as usize {
                return Err(ConfigError::IndexOutOfRange {
                    id: ids[self.participants as usize],
                    index: self.participants,
                    participants: self.participants,
                });
            }
        }
        Ok(())
    }

    /// Record layout shared by the network.
    pub fn layout(&self) -> Result<RecordLayout, ConfigError> {
        Ok(RecordLayout::new(
            self.participants,
            self.payload_len,
            self.sync,
        )?)
    }

    /// Listening time of a bootstrap round.
    pub fn bootstrap_duration(&self) -> u64 {
        self.duration
            .saturating_add(self.bootstrap_guard)
            .saturating_sub(self.guard)
    }

    /// Period of bootstrap rounds. Deliberately not a divisor of `period`.
    pub fn bootstrap_period(&self) -> u64 {
        self.bootstrap_duration().saturating_add(self.bootstrap_gap)
    }

    /// Reception deadline measured from start of frame, in hi ticks.
    pub fn rx_deadline_ticks(&self, layout: &RecordLayout) -> u64 {
        (layout.packet_len() as u64)
            .saturating_mul(self.rx_ticks_per_byte)
            .saturating_add(self.rx_slack_ticks)
    }

    /// Contribution index of node `id`.
    pub fn node_index(&self, id: u16) -> Result<u16, ConfigError> {
        let index = match &self.node_mapping {
            NodeIndexMapping::Offset { base } => id
                .checked_sub(*base)
                .ok_or(ConfigError::UnmappedNode(id))?,
            NodeIndexMapping::Table { ids } => ids
                .iter()
                .position(|&mapped| mapped == id)
                .ok_or(ConfigError::UnmappedNode(id))? as u16,
        };
        if index >= self.participants {
            return Err(ConfigError::IndexOutOfRange {
                id,
                index,
                participants: self.participants,
            });
        }
        Ok(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = ChaosConfig::default();
        config.validate().unwrap();
        assert_eq!(config.clock_phi, 128);
        assert_eq!(config.guard, 32);
        assert_eq!(config.bootstrap_duration(), 16384 - 32 + 1638);
        assert_eq!(config.bootstrap_period(), config.bootstrap_duration() + 327);
        assert_ne!(config.period % config.bootstrap_period(), 0);
    }

    #[test]
    fn test_rx_deadline() {
        let config = ChaosConfig {
            payload_len: 2,
            ..Default::default()
        };
        let layout = config.layout().unwrap();
        assert_eq!(config.rx_deadline_ticks(&layout), (11 * 35 + 200) * 4);
    }

    #[test]
    fn test_validate_rejects_bad_backoff() {
        let config = ChaosConfig {
            min_slots: 1,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::BackoffTooShort(1))));

        let config = ChaosConfig {
            min_slots: 6,
            max_slots: 4,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::BackoffRange { min: 6, max: 4 })
        ));
    }

    #[test]
    fn test_validate_rejects_oversized_layout() {
        let config = ChaosConfig {
            payload_len: 200,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Layout(_))));
    }

    #[test]
    fn test_validate_rejects_long_rounds() {
        let config = ChaosConfig {
            duration: 70_000,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::DurationTooLong { what: "round", .. })
        ));
    }

    #[test]
    fn test_validate_rejects_overflowing_timing() {
        let config = ChaosConfig {
            duration: u64::MAX - 1,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::TimingOverflow("duration + guard"))
        ));

        let config = ChaosConfig {
            period: u64::MAX,
            bootstrap_guard: u64::MAX,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::TimingOverflow("bootstrap period"))
        ));

        let config = ChaosConfig {
            rx_ticks_per_byte: u64::MAX,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::TimingOverflow("reception deadline"))
        ));
    }

    #[test]
    fn test_node_index_offset() {
        let config = ChaosConfig::default();
        assert_eq!(config.node_index(1).unwrap(), 0);
        assert_eq!(config.node_index(3).unwrap(), 2);
        assert!(matches!(config.node_index(0), Err(ConfigError::UnmappedNode(0))));
        assert!(matches!(
            config.node_index(4),
            Err(ConfigError::IndexOutOfRange { index: 3, .. })
        ));
    }

    #[test]
    fn test_node_index_table() {
        let config = ChaosConfig {
            node_mapping: NodeIndexMapping::Table {
                ids: vec![17, 4, 200],
            },
            ..Default::default()
        };
        assert_eq!(config.node_index(200).unwrap(), 2);
        assert_eq!(config.node_index(4).unwrap(), 1);
        assert!(matches!(config.node_index(5), Err(ConfigError::UnmappedNode(5))));
    }

    #[test]
    fn test_deserialize_partial_yaml() {
        let yaml = r#"
participants: 5
payload_len: 8
node_mapping:
  kind: table
  ids: [10, 11, 12, 13, 14]
"#;
        let config: ChaosConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.participants, 5);
        assert_eq!(config.n_tx, 255);
        assert_eq!(config.node_index(12).unwrap(), 2);
        config.validate().unwrap();
    }
}
