//! Binary frame used by the framed channel.

use crate::config::{MAGIC_BYTES, MAX_PAYLOAD_SIZE, PROTOCOL_VERSION};
use crate::error::{ProtocolError, Result};

/// Size of the fixed frame header: magic, version and big-endian length
pub const HEADER_SIZE: usize = 9;

/// A single frame on the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub version: u8,
    pub payload: Vec<u8>,
}

impl Packet {
    /// Wrap a payload in a frame stamped with the current protocol version
    pub fn new(payload: Vec<u8>) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            payload,
        }
    }

    /// Serialize the frame, header included
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_SIZE + self.payload.len());
        out.extend_from_slice(&MAGIC_BYTES);
        out.push(self.version);
        out.extend_from_slice(&(self.payload.len() as u32).to_be_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    /// Parse one complete frame from `data` using the default payload limit
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Self::from_bytes_with_limit(data, MAX_PAYLOAD_SIZE)
    }

    /// Parse one complete frame, rejecting payloads larger than `max_payload`
    pub fn from_bytes_with_limit(data: &[u8], max_payload: usize) -> Result<Self> {
        let length = parse_header(data, max_payload)?.ok_or(ProtocolError::InvalidHeader)?;

        let end = HEADER_SIZE + length;
        if data.len() < end {
            return Err(ProtocolError::InvalidHeader);
        }

        Ok(Self {
            version: data[4],
            payload: data[HEADER_SIZE..end].to_vec(),
        })
    }
}

/// Validate a frame header.
///
/// Returns `Ok(None)` when fewer than [`HEADER_SIZE`] bytes are available, and
/// the declared payload length otherwise.
pub(crate) fn parse_header(data: &[u8], max_payload: usize) -> Result<Option<usize>> {
    if data.len() < HEADER_SIZE {
        return Ok(None);
    }

    if data[0..4] != MAGIC_BYTES {
        return Err(ProtocolError::InvalidHeader);
    }

    let version = data[4];
    if version != PROTOCOL_VERSION {
        return Err(ProtocolError::UnsupportedVersion(version));
    }

    let length = u32::from_be_bytes([data[5], data[6], data[7], data[8]]) as usize;
    if length > max_payload {
        return Err(ProtocolError::OversizedPacket(length));
    }

    Ok(Some(length))
}
