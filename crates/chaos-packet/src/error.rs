//! Error types for chaos-packet.

use thiserror::Error;

/// Errors that can occur while building or decoding Chaos packets.
#[derive(Debug, Error)]
pub enum PacketError {
    /// The declared length byte does not match the configured packet length.
    #[error("Length mismatch: declared {declared}, expected {expected}")]
    LengthMismatch {
        /// Value of the length byte on the wire.
        declared: u8,
        /// Configured `PACKET_LEN`.
        expected: u8,
    },

    /// The header byte is below the lowest accepted header value.
    #[error("Invalid header byte: 0x{0:02x}")]
    InvalidHeader(u8),

    /// The buffer is shorter or longer than the frame it should hold.
    #[error("Frame size mismatch: {actual} bytes (expected {expected})")]
    FrameSize {
        /// Actual buffer size.
        actual: usize,
        /// Expected buffer size.
        expected: usize,
    },

    /// A record field does not fit the configured layout.
    #[error("Record field `{field}` has {actual} bytes (layout requires {expected})")]
    FieldSize {
        /// Name of the offending field.
        field: &'static str,
        /// Actual field size.
        actual: usize,
        /// Size required by the layout.
        expected: usize,
    },

    /// The configured layout cannot be carried by a single radio frame.
    #[error("Packet too large: {size} bytes (max {max})")]
    TooLarge {
        /// Resulting packet length.
        size: usize,
        /// Maximum allowed packet length.
        max: usize,
    },

    /// The layout has no participants.
    #[error("Layout must have at least one participant")]
    NoParticipants,
}

impl PacketError {
    /// Create a field size error.
    pub fn field(field: &'static str, actual: usize, expected: usize) -> Self {
        PacketError::FieldSize {
            field,
            actual,
            expected,
        }
    }
}
