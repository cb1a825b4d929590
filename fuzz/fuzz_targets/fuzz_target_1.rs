#![no_main]

use bytes::BytesMut;
use libfuzzer_sys::fuzz_target;
use netref_protocol::core::codec::PacketCodec;
use netref_protocol::Packet;
use tokio_util::codec::Decoder;

fuzz_target!(|data: &[u8]| {
    // Fuzz frame parsing - test for panics, crashes, infinite loops
    let _ = Packet::from_bytes(data);

    let mut codec = PacketCodec::new(64 * 1024);
    let mut buf = BytesMut::from(data);
    while let Ok(Some(_)) = codec.decode(&mut buf) {}
});
