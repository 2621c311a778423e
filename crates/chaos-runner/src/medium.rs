//! Shared radio medium.
//!
//! Frames are put on the air by the nodes and observed at start-of-frame by
//! every listening neighbour:
//!
//! | situation at a listener                          | outcome                                 |
//! |--------------------------------------------------|-----------------------------------------|
//! | idle, link roll succeeds                         | locks onto the frame                    |
//! | locked, identical bytes within the window        | constructive interference, no damage    |
//! | locked, anything else overlapping                | capture (either frame survives) or CRC failure |
//! | off or transmitting                              | nothing (half duplex)                   |
//!
//! The medium only keeps radio state. Turning its outcomes into
//! [`chaos_core::RadioEvent`]s is done by the simulation.

use chaos_packet::Footer;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, trace, warn};

// ============================================================================
// Configuration
// ============================================================================

/// Physical layer parameters (IEEE 802.15.4, 250 kbps).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MediumConfig {
    /// Largest start-of-frame offset at which identical frames still add up.
    pub constructive_window_ns: u64,
    /// Probability that a reception survives a non-constructive overlap.
    pub capture_probability: f64,
    /// Time from a transmit request to the start-of-frame delimiter on air
    /// (turnaround plus synchronization header).
    pub turnaround_ns: u64,
    /// Air time of one byte.
    pub byte_ns: u64,
    /// Bytes after start-of-frame before the header byte is available.
    pub header_bytes: u64,
    /// RSSI reported in the footer of every reception.
    pub rssi_dbm: i8,
    /// Correlation value reported in the footer.
    pub correlation: u8,
}

impl Default for MediumConfig {
    fn default() -> Self {
        MediumConfig {
            constructive_window_ns: 500,
            capture_probability: 0.8,
            turnaround_ns: 352_000,
            byte_ns: 32_000,
            header_bytes: 2,
            rssi_dbm: -70,
            correlation: 105,
        }
    }
}

// ============================================================================
// Radio State
// ============================================================================

/// Transceiver mode of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RadioMode {
    Off,
    Listening,
    Transmitting { frame: u64 },
}

/// A frame in flight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AirFrame {
    pub id: u64,
    pub source: usize,
    pub sfd_ns: u64,
    pub end_ns: u64,
    /// Length byte through record.
    pub bytes: Vec<u8>,
    /// The transmitter was switched off before the frame ended.
    pub aborted: bool,
}

/// Timing of a frame accepted by [`Medium::transmit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AirTiming {
    pub frame: u64,
    pub sfd_ns: u64,
    pub end_ns: u64,
}

#[derive(Debug, Clone)]
struct RxLock {
    id: u64,
    frame: u64,
    sfd_ns: u64,
    bytes: Vec<u8>,
    corrupted: bool,
}

#[derive(Debug, Clone)]
struct RadioPort {
    mode: RadioMode,
    lock: Option<RxLock>,
}

/// Who observed a start-of-frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SfdOutcome {
    /// The transmitter, if it is still sending this frame.
    pub source: Option<usize>,
    /// Listeners that locked onto the frame, with their lock ids.
    pub locked: Vec<(usize, u64)>,
    /// End of the frame.
    pub end_ns: u64,
}

/// Cumulative medium statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediumCounters {
    pub transmissions: u64,
    pub aborted: u64,
    /// Listeners that locked onto a frame.
    pub detections: u64,
    /// Link rolls that failed.
    pub missed: u64,
    pub constructive: u64,
    pub captures: u64,
    pub collisions: u64,
    /// Receptions handed over with a good CRC.
    pub delivered: u64,
    /// Receptions handed over with a bad CRC.
    pub corrupted: u64,
}

// ============================================================================
// Medium
// ============================================================================

/// Radio medium shared by all simulated nodes.
#[derive(Debug, Clone)]
pub struct Medium {
    config: MediumConfig,
    links: BTreeMap<(usize, usize), f64>,
    ports: Vec<RadioPort>,
    on_air: BTreeMap<u64, AirFrame>,
    next_frame: u64,
    next_lock: u64,
    counters: MediumCounters,
}

impl Medium {
    /// Medium for `node_count` radios. `links` maps ordered pairs to a packet
    /// reception ratio; missing pairs cannot hear each other.
    pub fn new(config: MediumConfig, node_count: usize, links: BTreeMap<(usize, usize), f64>) -> Self {
        Medium {
            config,
            links,
            ports: vec![
                RadioPort {
                    mode: RadioMode::Off,
                    lock: None,
                };
                node_count
            ],
            on_air: BTreeMap::new(),
            next_frame: 0,
            next_lock: 0,
            counters: MediumCounters::default(),
        }
    }

    pub fn config(&self) -> &MediumConfig {
        &self.config
    }

    pub fn counters(&self) -> &MediumCounters {
        &self.counters
    }

    /// Packet reception ratio from `from` to `to`.
    pub fn link(&self, from: usize, to: usize) -> f64 {
        self.links.get(&(from, to)).copied().unwrap_or(0.0)
    }

    pub fn mode(&self, node: usize) -> RadioMode {
        self.ports[node].mode
    }

    /// Whether `node` is still locked onto the reception `lock`.
    pub fn is_locked(&self, node: usize, lock: u64) -> bool {
        self.ports[node].lock.as_ref().is_some_and(|l| l.id == lock)
    }

    /// Frames currently on the air.
    pub fn frames_on_air(&self) -> impl Iterator<Item = &AirFrame> {
        self.on_air.values()
    }

    pub fn radio_on(&mut self, node: usize) {
        let port = &mut self.ports[node];
        if port.mode == RadioMode::Off {
            port.mode = RadioMode::Listening;
        }
    }

    /// Switch the radio off, abandoning any reception or transmission.
    pub fn radio_off(&mut self, node: usize) {
        let port = &mut self.ports[node];
        port.lock = None;
        if let RadioMode::Transmitting { frame } = port.mode {
            self.abort(frame);
        }
        self.ports[node].mode = RadioMode::Off;
    }

    /// Drop the reception in progress, keep listening.
    pub fn flush_rx(&mut self, node: usize) {
        if self.ports[node].lock.take().is_some() {
            trace!(node, "reception flushed");
        }
    }

    /// Start sending `bytes` at `at_ns`. Returns `None` if the radio is
    /// already transmitting.
    pub fn transmit(&mut self, node: usize, at_ns: u64, bytes: Vec<u8>) -> Option<AirTiming> {
        let port = &mut self.ports[node];
        if let RadioMode::Transmitting { frame } = port.mode {
            warn!(node, frame, "transmit request while already transmitting");
            return None;
        }
        let length = *bytes.first()? as u64;

        let id = self.next_frame;
        self.next_frame += 1;
        let sfd_ns = at_ns + self.config.turnaround_ns;
        let end_ns = sfd_ns + (1 + length) * self.config.byte_ns;

        port.mode = RadioMode::Transmitting { frame: id };
        port.lock = None;
        self.on_air.insert(
            id,
            AirFrame {
                id,
                source: node,
                sfd_ns,
                end_ns,
                bytes,
                aborted: false,
            },
        );
        self.counters.transmissions += 1;
        Some(AirTiming {
            frame: id,
            sfd_ns,
            end_ns,
        })
    }

    /// Start-of-frame of `frame` reaches the air.
    pub fn on_sfd<R: Rng>(&mut self, frame: u64, rng: &mut R) -> SfdOutcome {
        let Some(air) = self.on_air.get(&frame).filter(|air| !air.aborted).cloned() else {
            return SfdOutcome::default();
        };
        let mut outcome = SfdOutcome {
            source: (self.ports[air.source].mode == RadioMode::Transmitting { frame })
                .then_some(air.source),
            locked: Vec::new(),
            end_ns: air.end_ns,
        };

        for node in 0..self.ports.len() {
            if node == air.source || self.ports[node].mode != RadioMode::Listening {
                continue;
            }
            let prr = self.link(air.source, node);
            if prr <= 0.0 {
                continue;
            }

            if self.ports[node].lock.is_some() {
                self.overlap(node, &air, rng);
            } else if rng.gen::<f64>() < prr {
                let id = self.next_lock;
                self.next_lock += 1;
                self.ports[node].lock = Some(RxLock {
                    id,
                    frame: air.id,
                    sfd_ns: air.sfd_ns,
                    bytes: air.bytes.clone(),
                    corrupted: false,
                });
                self.counters.detections += 1;

                // Frames that were already on the air interfere as well
                let earlier: Vec<AirFrame> = self
                    .on_air
                    .values()
                    .filter(|other| {
                        other.id != air.id
                            && !other.aborted
                            && other.sfd_ns <= air.sfd_ns
                            && other.end_ns > air.sfd_ns
                            && self.link(other.source, node) > 0.0
                    })
                    .cloned()
                    .collect();
                for other in &earlier {
                    self.overlap(node, other, rng);
                }
                outcome.locked.push((node, id));
            } else {
                self.counters.missed += 1;
            }
        }
        outcome
    }

    /// `other` overlaps the reception in progress at `node`.
    fn overlap<R: Rng>(&mut self, node: usize, other: &AirFrame, rng: &mut R) {
        let window = self.config.constructive_window_ns;
        let capture = self.config.capture_probability;
        let Some(lock) = self.ports[node].lock.as_mut() else {
            return;
        };

        if lock.sfd_ns.abs_diff(other.sfd_ns) <= window && lock.bytes == other.bytes {
            self.counters.constructive += 1;
            return;
        }
        if rng.gen::<f64>() < capture {
            self.counters.captures += 1;
            if rng.gen_bool(0.5) {
                lock.frame = other.id;
                lock.bytes.clone_from(&other.bytes);
            }
        } else {
            if !lock.corrupted {
                debug!(node, frame = lock.frame, other = other.id, "collision");
            }
            self.counters.collisions += 1;
            lock.corrupted = true;
        }
    }

    fn abort(&mut self, frame: u64) {
        if let Some(air) = self.on_air.get_mut(&frame) {
            air.aborted = true;
            self.counters.aborted += 1;
        }
        for port in &mut self.ports {
            if let Some(lock) = port.lock.as_mut().filter(|lock| lock.frame == frame) {
                lock.corrupted = true;
            }
        }
    }

    /// Last byte of `frame` leaves the air. Returns the transmitter if it
    /// completed the frame and is back to listening.
    pub fn on_air_end(&mut self, frame: u64) -> Option<usize> {
        let air = self.on_air.remove(&frame)?;
        let port = &mut self.ports[air.source];
        if port.mode == (RadioMode::Transmitting { frame }) {
            port.mode = RadioMode::Listening;
            Some(air.source)
        } else {
            None
        }
    }

    /// Length and header bytes of the reception `lock`, if still locked.
    pub fn header_of(&self, node: usize, lock: u64) -> Option<(u8, u8)> {
        let lock = self.ports[node].lock.as_ref().filter(|l| l.id == lock)?;
        Some((*lock.bytes.first()?, *lock.bytes.get(1)?))
    }

    /// Complete the reception `lock` and return the received bytes, footer included.
    pub fn finish_rx(&mut self, node: usize, lock: u64) -> Option<Vec<u8>> {
        let port = &mut self.ports[node];
        if !port.lock.as_ref().is_some_and(|l| l.id == lock) {
            return None;
        }
        let lock = port.lock.take()?;
        let crc_ok = !lock.corrupted;
        if crc_ok {
            self.counters.delivered += 1;
        } else {
            self.counters.corrupted += 1;
        }
        let mut bytes = lock.bytes;
        let footer = Footer::new(self.config.rssi_dbm, crc_ok, self.config.correlation);
        bytes.extend_from_slice(&footer.to_bytes());
        Some(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chaos_packet::FOOTER_CRC_OK;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    /// Three radios, all pairs linked with `prr`.
    fn medium(config: MediumConfig, prr: f64) -> Medium {
        let mut links = BTreeMap::new();
        for a in 0..3 {
            for b in 0..3 {
                if a != b {
                    links.insert((a, b), prr);
                }
            }
        }
        let mut medium = Medium::new(config, 3, links);
        for node in 0..3 {
            medium.radio_on(node);
        }
        medium
    }

    fn frame(tag: u8) -> Vec<u8> {
        vec![4, 0xfe, tag, 0, 0]
    }

    fn crc_ok(bytes: &[u8]) -> bool {
        bytes[bytes.len() - 1] & FOOTER_CRC_OK != 0
    }

    #[test]
    fn test_single_frame_delivery() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let mut medium = medium(MediumConfig::default(), 1.0);

        let air = medium.transmit(0, 1_000, frame(7)).unwrap();
        assert_eq!(air.sfd_ns, 353_000);
        assert_eq!(air.end_ns, 353_000 + 5 * 32_000);
        assert_eq!(medium.mode(0), RadioMode::Transmitting { frame: air.frame });

        let outcome = medium.on_sfd(air.frame, &mut rng);
        assert_eq!(outcome.source, Some(0));
        assert_eq!(outcome.locked.len(), 2);
        let (node, lock) = outcome.locked[0];
        assert_eq!(medium.header_of(node, lock), Some((4, 0xfe)));

        assert_eq!(medium.on_air_end(air.frame), Some(0));
        assert_eq!(medium.mode(0), RadioMode::Listening);
        let bytes = medium.finish_rx(node, lock).unwrap();
        assert_eq!(&bytes[..5], frame(7).as_slice());
        assert!(crc_ok(&bytes));
        assert_eq!(medium.finish_rx(node, lock), None);
        assert_eq!(medium.counters().delivered, 1);
    }

    #[test]
    fn test_constructive_interference() {
        let mut rng = ChaCha8Rng::seed_from_u64(2);
        let mut medium = medium(
            MediumConfig {
                capture_probability: 0.0,
                ..Default::default()
            },
            1.0,
        );

        let a = medium.transmit(0, 0, frame(1)).unwrap();
        let b = medium.transmit(1, 300, frame(1)).unwrap();
        medium.on_sfd(a.frame, &mut rng);
        let outcome = medium.on_sfd(b.frame, &mut rng);
        assert!(outcome.locked.is_empty());

        let bytes = medium.finish_rx(2, 0).unwrap();
        assert!(crc_ok(&bytes));
        assert_eq!(medium.counters().constructive, 1);
    }

    #[test]
    fn test_differing_frames_collide_without_capture() {
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let mut medium = medium(
            MediumConfig {
                capture_probability: 0.0,
                ..Default::default()
            },
            1.0,
        );

        let a = medium.transmit(0, 0, frame(1)).unwrap();
        let b = medium.transmit(1, 0, frame(2)).unwrap();
        medium.on_sfd(a.frame, &mut rng);
        medium.on_sfd(b.frame, &mut rng);

        let bytes = medium.finish_rx(2, 0).unwrap();
        assert!(!crc_ok(&bytes));
        assert_eq!(medium.counters().collisions, 1);
    }

    #[test]
    fn test_capture_keeps_one_frame_intact() {
        let mut rng = ChaCha8Rng::seed_from_u64(4);
        let mut medium = medium(
            MediumConfig {
                capture_probability: 1.0,
                ..Default::default()
            },
            1.0,
        );

        let a = medium.transmit(0, 0, frame(1)).unwrap();
        let b = medium.transmit(1, 0, frame(2)).unwrap();
        medium.on_sfd(a.frame, &mut rng);
        medium.on_sfd(b.frame, &mut rng);

        let bytes = medium.finish_rx(2, 0).unwrap();
        assert!(crc_ok(&bytes));
        assert!(bytes[2] == 1 || bytes[2] == 2);
        assert_eq!(medium.counters().captures, 1);
    }

    #[test]
    fn test_late_listener_sees_interference() {
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        let mut medium = medium(
            MediumConfig {
                capture_probability: 0.0,
                ..Default::default()
            },
            1.0,
        );

        // Node 2 is deaf while the first frame starts
        medium.radio_off(2);
        let a = medium.transmit(0, 0, frame(1)).unwrap();
        medium.on_sfd(a.frame, &mut rng);
        medium.radio_on(2);

        let b = medium.transmit(1, 100_000, frame(2)).unwrap();
        let outcome = medium.on_sfd(b.frame, &mut rng);
        let (node, lock) = outcome.locked[0];
        assert_eq!(node, 2);
        assert!(!crc_ok(&medium.finish_rx(node, lock).unwrap()));
    }

    #[test]
    fn test_half_duplex_and_lossy_links() {
        let mut rng = ChaCha8Rng::seed_from_u64(6);
        let mut medium = medium(MediumConfig::default(), 0.0);
        medium.radio_off(1);
        let a = medium.transmit(0, 0, frame(1)).unwrap();
        let outcome = medium.on_sfd(a.frame, &mut rng);
        assert!(outcome.locked.is_empty());
        assert_eq!(medium.counters().missed, 0);

        // A busy radio refuses a second frame
        assert!(medium.transmit(0, 10, frame(2)).is_none());
    }

    #[test]
    fn test_flush_and_abort() {
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let mut medium = medium(MediumConfig::default(), 1.0);

        let a = medium.transmit(0, 0, frame(1)).unwrap();
        let outcome = medium.on_sfd(a.frame, &mut rng);
        let (first, first_lock) = outcome.locked[0];
        let (second, second_lock) = outcome.locked[1];

        medium.flush_rx(first);
        assert!(!medium.is_locked(first, first_lock));
        assert_eq!(medium.header_of(first, first_lock), None);

        medium.radio_off(0);
        assert_eq!(medium.counters().aborted, 1);
        assert_eq!(medium.on_air_end(a.frame), None);
        assert!(!crc_ok(&medium.finish_rx(second, second_lock).unwrap()));
    }
}
