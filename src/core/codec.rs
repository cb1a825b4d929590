//! Tokio codec implementing the framed channel.
//!
//! The decoder never consumes a partial frame: it returns `Ok(None)` until a
//! whole frame is buffered, so reads resume where they left off. Oversized or
//! malformed headers are errors; the connection treats them as fatal.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::config::MAX_PAYLOAD_SIZE;
use crate::core::packet::{parse_header, Packet, HEADER_SIZE};
use crate::error::{ProtocolError, Result};

#[derive(Debug, Clone, Copy)]
pub struct PacketCodec {
    max_payload: usize,
}

impl PacketCodec {
    /// Codec with an explicit payload limit
    pub fn new(max_payload: usize) -> Self {
        Self { max_payload }
    }

    pub fn max_payload(&self) -> usize {
        self.max_payload
    }
}

impl Default for PacketCodec {
    fn default() -> Self {
        Self::new(MAX_PAYLOAD_SIZE)
    }
}

impl Decoder for PacketCodec {
    type Item = Packet;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Packet>> {
        let Some(length) = parse_header(src, self.max_payload)? else {
            return Ok(None);
        };

        let total = HEADER_SIZE + length;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        let version = src[4];
        src.advance(HEADER_SIZE);
        let payload = src.split_to(length).to_vec();

        Ok(Some(Packet { version, payload }))
    }
}

impl Encoder<Packet> for PacketCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<()> {
        if item.payload.len() > self.max_payload {
            return Err(ProtocolError::OversizedPacket(item.payload.len()));
        }

        dst.reserve(HEADER_SIZE + item.payload.len());
        dst.put_slice(&crate::config::MAGIC_BYTES);
        dst.put_u8(item.version);
        dst.put_u32(item.payload.len() as u32);
        dst.put_slice(&item.payload);
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_frame_waits() {
        let mut codec = PacketCodec::default();
        let bytes = Packet::new(vec![1, 2, 3, 4, 5]).to_bytes();

        let mut buf = BytesMut::from(&bytes[..7]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 7);

        buf.extend_from_slice(&bytes[7..]);
        let packet = codec.decode(&mut buf).unwrap().expect("complete frame");
        assert_eq!(packet.payload, vec![1, 2, 3, 4, 5]);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_back_to_back_frames() {
        let mut codec = PacketCodec::default();
        let mut buf = BytesMut::new();
        codec.encode(Packet::new(vec![1]), &mut buf).unwrap();
        codec.encode(Packet::new(vec![2, 2]), &mut buf).unwrap();

        assert_eq!(codec.decode(&mut buf).unwrap().unwrap().payload, vec![1]);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap().payload, vec![2, 2]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_encode_rejects_oversized() {
        let mut codec = PacketCodec::new(4);
        let mut buf = BytesMut::new();
        let result = codec.encode(Packet::new(vec![0; 5]), &mut buf);
        assert!(matches!(result, Err(ProtocolError::OversizedPacket(5))));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_rejects_oversized_header() {
        let mut codec = PacketCodec::new(16);
        let bytes = Packet::new(vec![0; 32]).to_bytes();
        let mut buf = BytesMut::from(&bytes[..HEADER_SIZE]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtocolError::OversizedPacket(32))
        ));
    }
}
