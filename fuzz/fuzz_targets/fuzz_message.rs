#![no_main]

use libfuzzer_sys::fuzz_target;
use netref_protocol::core::serialization::{MultiFormat, SerializationFormat};
use netref_protocol::protocol::message::{Message, RemoteException};

fuzz_target!(|data: &[u8]| {
    // Fuzz message decoding in every format, then the exception payload parser
    if data.len() < 4 {
        return;
    }

    for format in [
        SerializationFormat::Bincode,
        SerializationFormat::Json,
        SerializationFormat::MessagePack,
    ] {
        if let Ok(msg) = Message::deserialize_format(data, format) {
            let _ = RemoteException::from_values(&msg.args);
            let _ = msg.args.iter().map(|v| v.markers()).count();
            if let Ok(serialized) = msg.serialize_format(format) {
                let _ = Message::deserialize_format(&serialized, format);
            }
        }
    }
});
