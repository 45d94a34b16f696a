use bytes::Bytes;

use super::opcode::{FrameShape, Opcode};

/// Largest payload a length-prefixed frame can carry.
pub const MAX_PAYLOAD_LEN: usize = u16::MAX as usize;

/// One decoded protocol unit.
///
/// For [`Opcode::Channel`] the payload holds the 2-byte channel id; for bare
/// opcodes it is empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub opcode: Opcode,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(opcode: Opcode, payload: impl Into<Bytes>) -> Self {
        Self {
            opcode,
            payload: payload.into(),
        }
    }

    pub fn bare(opcode: Opcode) -> Self {
        Self {
            opcode,
            payload: Bytes::new(),
        }
    }

    pub fn channel(id: u16) -> Self {
        Self::new(Opcode::Channel, Bytes::copy_from_slice(&id.to_be_bytes()))
    }

    /// Channel id carried by a channel-open frame.
    pub fn channel_id(&self) -> Option<u16> {
        if self.opcode != Opcode::Channel || self.payload.len() != 2 {
            return None;
        }
        Some(u16::from_be_bytes([self.payload[0], self.payload[1]]))
    }

    /// Payload as text. HMUX strings are ASCII in practice; invalid UTF-8 is
    /// replaced rather than rejected.
    pub fn payload_str(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }

    /// Number of bytes this frame occupies on the wire.
    pub fn encoded_len(&self) -> usize {
        match self.opcode.shape() {
            FrameShape::Bare => 1,
            FrameShape::Channel => 3,
            FrameShape::Length => 3 + self.payload.len(),
        }
    }
}
