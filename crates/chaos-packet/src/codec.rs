//! Frame encoding and decoding.
//!
//! Two views of the same bytes are provided:
//!
//! - [`WirePacket`] with [`encode_packet`] / [`decode_packet`]: an owned,
//!   fully decoded frame, convenient for tests, tooling and the simulator.
//! - [`WireFrame`]: a fixed-size buffer that the slot state machine receives
//!   into, merges into and relays from without ever building a second copy.
//!
//! Both validate the length byte and then the header byte before reading any
//! other field.

use crate::{
    FloodRecord, PacketError, RecordLayout, FOOTER_CORRELATION, FOOTER_CRC_OK, FOOTER_LEN,
    HEADER_ACTIVE,
};
use serde::{Deserialize, Serialize};

// ============================================================================
// Footer
// ============================================================================

/// Link-quality footer appended by the radio on reception.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Footer {
    /// Received signal strength (raw register value).
    pub rssi: i8,
    /// Status byte: bit 7 = CRC ok, bits 0..6 = correlation.
    pub status: u8,
}

impl Footer {
    /// Build a footer from a CRC verdict and a correlation value.
    pub fn new(rssi: i8, crc_ok: bool, correlation: u8) -> Self {
        let crc = if crc_ok { FOOTER_CRC_OK } else { 0 };
        Footer {
            rssi,
            status: crc | (correlation & FOOTER_CORRELATION),
        }
    }

    /// Whether the radio reported a valid CRC.
    pub fn crc_ok(&self) -> bool {
        self.status & FOOTER_CRC_OK != 0
    }

    /// Link correlation indicator.
    pub fn correlation(&self) -> u8 {
        self.status & FOOTER_CORRELATION
    }

    /// Footer as the two bytes the radio appends.
    pub fn to_bytes(self) -> [u8; FOOTER_LEN] {
        [self.rssi as u8, self.status]
    }

    fn from_bytes(bytes: &[u8]) -> Self {
        Footer {
            rssi: bytes[0] as i8,
            status: bytes[1],
        }
    }
}

// ============================================================================
// Prefix Validation
// ============================================================================

/// Validate the length and header bytes of an incoming frame.
///
/// This is the only check performed while a frame is still arriving; nothing
/// after the header may be trusted before it succeeds.
pub fn check_prefix(layout: &RecordLayout, length: u8, header: u8) -> Result<(), PacketError> {
    if length != layout.packet_len() {
        return Err(PacketError::LengthMismatch {
            declared: length,
            expected: layout.packet_len(),
        });
    }
    if header < HEADER_ACTIVE {
        return Err(PacketError::InvalidHeader(header));
    }
    Ok(())
}

// ============================================================================
// Owned Packet
// ============================================================================

/// Fully decoded frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WirePacket {
    /// [`crate::HEADER_ACTIVE`] or [`crate::HEADER_FINAL`].
    pub header: u8,
    /// Relay counter, present iff the layout has synchronization enabled.
    pub relay_counter: Option<u8>,
    /// Carried record.
    pub record: FloodRecord,
    /// Radio footer (only meaningful on received frames).
    pub footer: Footer,
}

/// Encode the transmitted part of a frame (length byte through the record).
///
/// The footer is not included: the radio appends it on the receiving side.
pub fn encode_packet(packet: &WirePacket, layout: &RecordLayout) -> Result<Vec<u8>, PacketError> {
    packet.record.check(layout)?;
    if packet.header < HEADER_ACTIVE {
        return Err(PacketError::InvalidHeader(packet.header));
    }

    let mut buf = Vec::with_capacity(layout.tx_len());

    // 1. Length byte
    buf.push(layout.packet_len());

    // 2. Header byte
    buf.push(packet.header);

    // 3. Relay counter (sync only)
    if layout.sync() {
        buf.push(packet.relay_counter.unwrap_or(0));
    }

    // 4. Record
    let start = buf.len();
    buf.resize(start + layout.data_len(), 0);
    packet.record.write_to(&mut buf[start..]);

    Ok(buf)
}

/// Decode a received frame (including its footer).
pub fn decode_packet(frame: &[u8], layout: &RecordLayout) -> Result<WirePacket, PacketError> {
    if frame.len() != layout.frame_len() {
        return Err(PacketError::FrameSize {
            actual: frame.len(),
            expected: layout.frame_len(),
        });
    }
    check_prefix(layout, frame[0], frame[1])?;

    let relay_counter = layout.sync().then(|| frame[2]);
    let data_start = layout.data_offset();
    let data_end = data_start + layout.data_len();

    Ok(WirePacket {
        header: frame[1],
        relay_counter,
        record: FloodRecord::read_from(&frame[data_start..data_end], layout),
        footer: Footer::from_bytes(&frame[data_end..]),
    })
}

// ============================================================================
// In-place Frame Buffer
// ============================================================================

/// Fixed-size frame buffer used for reception, in-place merge and relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireFrame {
    layout: RecordLayout,
    buf: Vec<u8>,
}

impl WireFrame {
    /// Create a zeroed buffer with the length byte already set.
    pub fn new(layout: RecordLayout) -> Self {
        let mut buf = vec![0; layout.frame_len()];
        buf[0] = layout.packet_len();
        WireFrame { layout, buf }
    }

    /// Layout the buffer is shaped for.
    pub fn layout(&self) -> &RecordLayout {
        &self.layout
    }

    /// Load an outgoing record with the given header and a zero relay counter.
    pub fn load(&mut self, record: &FloodRecord, header: u8) -> Result<(), PacketError> {
        record.check(&self.layout)?;
        self.buf[0] = self.layout.packet_len();
        self.buf[1] = header;
        self.set_relay_counter(0);
        let start = self.layout.data_offset();
        let end = start + self.layout.data_len();
        record.write_to(&mut self.buf[start..end]);
        Ok(())
    }

    /// Copy a received frame into the buffer, validating size, length and header.
    ///
    /// On error the buffer is left untouched.
    pub fn receive(&mut self, frame: &[u8]) -> Result<(), PacketError> {
        if frame.len() != self.buf.len() {
            return Err(PacketError::FrameSize {
                actual: frame.len(),
                expected: self.buf.len(),
            });
        }
        check_prefix(&self.layout, frame[0], frame[1])?;
        self.buf.copy_from_slice(frame);
        Ok(())
    }

    /// Value of the length byte.
    pub fn length(&self) -> u8 {
        self.buf[0]
    }

    /// Header byte.
    pub fn header(&self) -> u8 {
        self.buf[1]
    }

    /// Overwrite the header byte.
    pub fn set_header(&mut self, header: u8) {
        self.buf[1] = header;
    }

    /// Relay counter, if the layout carries one.
    pub fn relay_counter(&self) -> Option<u8> {
        self.layout.sync().then(|| self.buf[2])
    }

    /// Overwrite the relay counter (no-op without synchronization).
    pub fn set_relay_counter(&mut self, value: u8) {
        if self.layout.sync() {
            self.buf[2] = value;
        }
    }

    /// Sequence number of the carried record.
    pub fn seq_no(&self) -> u32 {
        let at = self.layout.data_offset();
        u32::from_le_bytes([
            self.buf[at],
            self.buf[at + 1],
            self.buf[at + 2],
            self.buf[at + 3],
        ])
    }

    /// Contribution bitmap.
    pub fn flags(&self) -> &[u8] {
        let at = self.layout.flags_offset();
        &self.buf[at..at + self.layout.flags_len()]
    }

    /// Mutable contribution bitmap, for in-place merging.
    pub fn flags_mut(&mut self) -> &mut [u8] {
        let at = self.layout.flags_offset();
        let len = self.layout.flags_len();
        &mut self.buf[at..at + len]
    }

    /// Decode the carried record.
    pub fn record(&self) -> FloodRecord {
        let start = self.layout.data_offset();
        FloodRecord::read_from(&self.buf[start..start + self.layout.data_len()], &self.layout)
    }

    /// Overwrite `record` with the carried record, reusing its allocations.
    pub fn copy_record_into(&self, record: &mut FloodRecord) {
        let flags_at = self.layout.flags_offset();
        let payload_at = flags_at + self.layout.flags_len();
        record.seq_no = self.seq_no();
        record.flags.clear();
        record.flags.extend_from_slice(self.flags());
        record.payload.clear();
        record
            .payload
            .extend_from_slice(&self.buf[payload_at..payload_at + self.layout.payload_len()]);
    }

    /// Radio footer of the last received frame.
    pub fn footer(&self) -> Footer {
        Footer::from_bytes(&self.buf[self.layout.tx_len()..])
    }

    /// Bytes handed to the radio for transmission.
    pub fn tx_bytes(&self) -> &[u8] {
        &self.buf[..self.layout.tx_len()]
    }

    /// Whole buffer, footer included.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }
}
