//! # chaos-packet
//!
//! Record layout, wire encoding and bitmap merging for Chaos all-to-all floods.
//!
//! A Chaos round carries one fixed-size [`FloodRecord`] that every node
//! contributes to. The record travels inside a fixed-length radio frame whose
//! shape is fully determined by a [`RecordLayout`]:
//!
//! | Field         | Size (bytes)          | Description                                         |
//! |---------------|-----------------------|-----------------------------------------------------|
//! | length        | 1                     | `PACKET_LEN`, number of bytes following this field. |
//! | header        | 1                     | [`HEADER_ACTIVE`] or [`HEADER_FINAL`].              |
//! | relay_counter | 1 (sync only)         | Hop count, incremented once per relay.              |
//! | seq_no        | 4                     | Round sequence number (little-endian).              |
//! | flags         | `ceil(N / 8)`         | One contribution bit per participant.               |
//! | payload       | `L`                   | Application data.                                   |
//! | footer        | 2                     | RSSI, then status byte (bit 7 = CRC ok).            |

mod codec;
mod error;
mod merge;

pub use codec::{check_prefix, decode_packet, encode_packet, Footer, WireFrame, WirePacket};
pub use error::PacketError;
pub use merge::{is_complete, merge_flags, MergeOutcome};

use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// Constants
// ============================================================================

/// Header of a frame belonging to a flood that is still collecting contributions.
pub const HEADER_ACTIVE: u8 = 0xfe;

/// Header of a frame sent on the final pass (complete bitmap or timeout transmission).
///
/// Frames carrying this header are relayed but never used for slot-length estimation.
pub const HEADER_FINAL: u8 = HEADER_ACTIVE + 1;

/// Size of the header field.
pub const HEADER_LEN: usize = 1;

/// Size of the relay counter field (present only when synchronization is enabled).
pub const RELAY_COUNTER_LEN: usize = 1;

/// Size of the sequence number inside a record.
pub const SEQ_NO_LEN: usize = 4;

/// Size of the footer appended by the radio (RSSI + status).
pub const FOOTER_LEN: usize = 2;

/// Status footer bit set by the radio when the frame CRC was valid.
pub const FOOTER_CRC_OK: u8 = 0x80;

/// Status footer bits holding the link correlation value.
pub const FOOTER_CORRELATION: u8 = 0x7f;

/// Largest value the length byte may take (IEEE 802.15.4 PHY limit).
pub const MAX_PACKET_LEN: usize = 127;

// ============================================================================
// Record Layout
// ============================================================================

/// Network-wide shape of the flood record and its wire frame.
///
/// All nodes of a network must share the same layout: the length byte of every
/// received frame is checked against [`RecordLayout::packet_len`] before any
/// other field is trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordLayout {
    participants: u16,
    payload_len: usize,
    sync: bool,
}

impl RecordLayout {
    /// Create a layout, rejecting shapes that do not fit one radio frame.
    pub fn new(participants: u16, payload_len: usize, sync: bool) -> Result<Self, PacketError> {
        if participants == 0 {
            return Err(PacketError::NoParticipants);
        }
        let layout = RecordLayout {
            participants,
            payload_len,
            sync,
        };
        let size = layout.packet_len_usize();
        if size > MAX_PACKET_LEN {
            return Err(PacketError::TooLarge {
                size,
                max: MAX_PACKET_LEN,
            });
        }
        Ok(layout)
    }

    /// Number of participants (bits in the bitmap).
    pub fn participants(&self) -> u16 {
        self.participants
    }

    /// Payload length in bytes.
    pub fn payload_len(&self) -> usize {
        self.payload_len
    }

    /// Whether frames carry a relay counter.
    pub fn sync(&self) -> bool {
        self.sync
    }

    /// Bitmap length: `ceil(participants / 8)`.
    pub fn flags_len(&self) -> usize {
        (self.participants as usize).div_ceil(8)
    }

    /// Value of the last bitmap byte once every participant has contributed.
    ///
    /// All other bytes must be `0xff`.
    pub fn completion_mask(&self) -> u8 {
        let bits = ((self.participants - 1) % 8) + 1;
        ((1u16 << bits) - 1) as u8
    }

    /// Size of an encoded record.
    pub fn data_len(&self) -> usize {
        SEQ_NO_LEN + self.flags_len() + self.payload_len
    }

    /// `PACKET_LEN`: the value carried by the length byte.
    pub fn packet_len(&self) -> u8 {
        // Bounded by MAX_PACKET_LEN in `new`.
        self.packet_len_usize() as u8
    }

    fn packet_len_usize(&self) -> usize {
        HEADER_LEN + self.relay_counter_len() + self.data_len() + FOOTER_LEN
    }

    /// Full frame size including the length byte and the footer.
    pub fn frame_len(&self) -> usize {
        1 + self.packet_len_usize()
    }

    /// Number of bytes handed to the radio for transmission (footer excluded).
    pub fn tx_len(&self) -> usize {
        self.frame_len() - FOOTER_LEN
    }

    fn relay_counter_len(&self) -> usize {
        if self.sync {
            RELAY_COUNTER_LEN
        } else {
            0
        }
    }

    /// Offset of the first record byte inside a frame.
    pub fn data_offset(&self) -> usize {
        1 + HEADER_LEN + self.relay_counter_len()
    }

    /// Offset of the bitmap inside a frame.
    pub fn flags_offset(&self) -> usize {
        self.data_offset() + SEQ_NO_LEN
    }
}

// ============================================================================
// Flood Record
// ============================================================================

/// Application-visible record carried by a round.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FloodRecord {
    /// Sequence number, bumped by the initiator once per round.
    pub seq_no: u32,
    /// Contribution bitmap, one bit per participant (LSB of byte 0 is index 0).
    pub flags: Vec<u8>,
    /// Application payload.
    pub payload: Vec<u8>,
}

impl FloodRecord {
    /// Create an all-zero record shaped for `layout`.
    pub fn new(layout: &RecordLayout) -> Self {
        FloodRecord {
            seq_no: 0,
            flags: vec![0; layout.flags_len()],
            payload: vec![0; layout.payload_len()],
        }
    }

    /// Check that field sizes match `layout`.
    pub fn check(&self, layout: &RecordLayout) -> Result<(), PacketError> {
        if self.flags.len() != layout.flags_len() {
            return Err(PacketError::field("flags", self.flags.len(), layout.flags_len()));
        }
        if self.payload.len() != layout.payload_len() {
            return Err(PacketError::field(
                "payload",
                self.payload.len(),
                layout.payload_len(),
            ));
        }
        Ok(())
    }

    /// Clear the bitmap and set only the bit of `index`.
    ///
    /// Returns `false` (leaving the bitmap cleared) if `index` lies outside the bitmap.
    pub fn set_own_contribution(&mut self, index: u16) -> bool {
        self.flags.iter_mut().for_each(|b| *b = 0);
        let byte = index as usize / 8;
        match self.flags.get_mut(byte) {
            Some(b) => {
                *b = 1 << (index % 8);
                true
            }
            None => false,
        }
    }

    /// Whether participant `index` has contributed.
    pub fn has_contribution(&self, index: u16) -> bool {
        self.flags
            .get(index as usize / 8)
            .is_some_and(|b| b & (1 << (index % 8)) != 0)
    }

    /// Number of participants that have contributed.
    pub fn contributors(&self) -> u32 {
        self.flags.iter().map(|b| b.count_ones()).sum()
    }

    /// Whether every participant of `layout` has contributed.
    pub fn is_complete(&self, layout: &RecordLayout) -> bool {
        is_complete(&self.flags, layout.completion_mask())
    }

    /// Encode into `out`, which must be exactly `layout.data_len()` bytes.
    pub(crate) fn write_to(&self, out: &mut [u8]) {
        let flags_end = SEQ_NO_LEN + self.flags.len();
        out[..SEQ_NO_LEN].copy_from_slice(&self.seq_no.to_le_bytes());
        out[SEQ_NO_LEN..flags_end].copy_from_slice(&self.flags);
        out[flags_end..flags_end + self.payload.len()].copy_from_slice(&self.payload);
    }

    /// Decode from exactly `layout.data_len()` bytes.
    pub(crate) fn read_from(data: &[u8], layout: &RecordLayout) -> Self {
        let flags_end = SEQ_NO_LEN + layout.flags_len();
        FloodRecord {
            seq_no: u32::from_le_bytes([data[0], data[1], data[2], data[3]]),
            flags: data[SEQ_NO_LEN..flags_end].to_vec(),
            payload: data[flags_end..flags_end + layout.payload_len()].to_vec(),
        }
    }
}

impl fmt::Display for FloodRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "seq={} flags={} payload={}B",
            self.seq_no,
            hex::encode(&self.flags),
            self.payload.len()
        )
    }
}
