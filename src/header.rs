//! Header preceding a serialized payload.

use crate::error::{Error, Result};

/// `(tag, bytes)` pair sent on the primary channel ahead of a serialized payload.
///
/// The payload itself travels on the shadow channel under `tag`. The header has
/// a fixed 12-byte little-endian layout (`i32` tag, then `i64` length) so it can
/// be sent without going through the serializer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SerializedMessageHeader {
    /// Shadow-channel tag carrying the payload.
    pub tag: i32,
    /// Payload length in bytes; zero means no payload message follows.
    pub bytes: i64,
}

impl SerializedMessageHeader {
    /// Size of the header on the wire.
    pub const WIRE_SIZE: usize = 12;

    /// Encode into the fixed wire layout.
    pub fn to_wire(self) -> [u8; Self::WIRE_SIZE] {
        let mut out = [0u8; Self::WIRE_SIZE];
        out[..4].copy_from_slice(&self.tag.to_le_bytes());
        out[4..].copy_from_slice(&self.bytes.to_le_bytes());
        out
    }

    /// Decode from the fixed wire layout.
    pub fn from_wire(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != Self::WIRE_SIZE {
            return Err(Error::Protocol(format!(
                "serialized message header is {} bytes, expected {}",
                bytes.len(),
                Self::WIRE_SIZE
            )));
        }
        let mut tag = [0u8; 4];
        let mut len = [0u8; 8];
        tag.copy_from_slice(&bytes[..4]);
        len.copy_from_slice(&bytes[4..]);
        let header = SerializedMessageHeader {
            tag: i32::from_le_bytes(tag),
            bytes: i64::from_le_bytes(len),
        };
        if header.bytes < 0 {
            return Err(Error::Protocol(format!(
                "negative payload length {} in header",
                header.bytes
            )));
        }
        Ok(header)
    }

    /// Payload length as a buffer size.
    pub(crate) fn payload_len(&self) -> usize {
        self.bytes as usize
    }
}
