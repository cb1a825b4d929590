//! # Serialization Formats
//!
//! The message codec: turns protocol [`Message`](crate::protocol::message::Message)s
//! into frame payloads and back. Supports bincode (default), JSON (debugging/interop)
//! and MessagePack (compact encoding). Both peers of a connection must agree on the
//! format; it is fixed per connection by [`ConnectionConfig::format`](crate::config::ConnectionConfig).
//!
//! Reference markers are ordinary enum variants of the wire
//! [`Value`](crate::protocol::value::Value), so every format keeps them
//! distinguishable from plain values.
//!
//! ## Usage
//! ```ignore
//! use netref_protocol::core::serialization::{MultiFormat, SerializationFormat};
//!
//! let bytes = message.serialize_format(SerializationFormat::Bincode)?;
//! let decoded = Message::deserialize_format(&bytes, SerializationFormat::Bincode)?;
//! ```

use serde::{Deserialize, Serialize};

/// Supported serialization formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SerializationFormat {
    /// Binary compact format (default, fastest)
    #[default]
    Bincode,
    /// Human-readable JSON format (debugging, interop)
    Json,
    /// Compact binary format (MessagePack, efficient)
    MessagePack,
}

impl SerializationFormat {
    /// Get the format identifier byte for wire protocol
    pub fn format_byte(self) -> u8 {
        match self {
            SerializationFormat::Bincode => 0x01,
            SerializationFormat::Json => 0x02,
            SerializationFormat::MessagePack => 0x03,
        }
    }

    /// Detect format from identifier byte
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(SerializationFormat::Bincode),
            0x02 => Some(SerializationFormat::Json),
            0x03 => Some(SerializationFormat::MessagePack),
            _ => None,
        }
    }

    /// Get human-readable name
    pub fn name(self) -> &'static str {
        match self {
            SerializationFormat::Bincode => "Bincode",
            SerializationFormat::Json => "JSON",
            SerializationFormat::MessagePack => "MessagePack",
        }
    }
}

/// Trait for types that support multiple serialization formats
pub trait MultiFormat: Serialize + for<'de> Deserialize<'de> + Sized {
    /// Serialize to bytes using the specified format
    fn serialize_format(&self, format: SerializationFormat) -> crate::error::Result<Vec<u8>> {
        match format {
            SerializationFormat::Bincode => bincode::serialize(self)
                .map_err(|e| crate::error::ProtocolError::SerializeError(e.to_string())),
            SerializationFormat::Json => serde_json::to_vec(self)
                .map_err(|e| crate::error::ProtocolError::SerializeError(e.to_string())),
            SerializationFormat::MessagePack => rmp_serde::to_vec(self)
                .map_err(|e| crate::error::ProtocolError::SerializeError(e.to_string())),
        }
    }

    /// Serialize to bytes with format header
    fn serialize_with_header(&self, format: SerializationFormat) -> crate::error::Result<Vec<u8>> {
        let mut data = vec![format.format_byte()];
        let mut payload = self.serialize_format(format)?;
        data.append(&mut payload);
        Ok(data)
    }

    /// Deserialize from bytes using the specified format
    fn deserialize_format(data: &[u8], format: SerializationFormat) -> crate::error::Result<Self> {
        match format {
            SerializationFormat::Bincode => bincode::deserialize(data)
                .map_err(|e| crate::error::ProtocolError::DeserializeError(e.to_string())),
            SerializationFormat::Json => serde_json::from_slice(data)
                .map_err(|e| crate::error::ProtocolError::DeserializeError(e.to_string())),
            SerializationFormat::MessagePack => rmp_serde::from_slice(data)
                .map_err(|e| crate::error::ProtocolError::DeserializeError(e.to_string())),
        }
    }

    /// Deserialize from bytes with format header
    fn deserialize_with_header(data: &[u8]) -> crate::error::Result<(Self, SerializationFormat)> {
        if data.is_empty() {
            return Err(crate::error::ProtocolError::DeserializeError(
                "Empty data".to_string(),
            ));
        }

        let format = SerializationFormat::from_byte(data[0]).ok_or_else(|| {
            crate::error::ProtocolError::DeserializeError(format!(
                "Unknown format byte: {}",
                data[0]
            ))
        })?;

        let value = Self::deserialize_format(&data[1..], format)?;
        Ok((value, format))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::message::{Handler, Message};
    use crate::protocol::value::{RefMarker, TypeInfo, Value};

    fn sample() -> Message {
        Message::request(
            7,
            Handler::CallAttr,
            vec![
                Value::LocalRef(3),
                Value::Str("scale".into()),
                Value::Tuple(vec![Value::Float(1.5), Value::Bytes(vec![0, 1])]),
                Value::Map(vec![(
                    Value::Str("target".into()),
                    Value::Ref(RefMarker {
                        object_id: 9,
                        type_info: TypeInfo::new("Sink"),
                    }),
                )]),
            ],
        )
    }

    #[test]
    #[allow(clippy::expect_used)]
    fn test_format_byte_roundtrip() {
        for format in &[
            SerializationFormat::Bincode,
            SerializationFormat::Json,
            SerializationFormat::MessagePack,
        ] {
            let byte = format.format_byte();
            let recovered = SerializationFormat::from_byte(byte).expect("valid format byte");
            assert_eq!(*format, recovered);
        }
        assert_eq!(SerializationFormat::from_byte(0x7F), None);
    }

    #[test]
    fn test_default_format() {
        assert_eq!(SerializationFormat::default(), SerializationFormat::Bincode);
    }

    #[test]
    #[allow(clippy::expect_used)]
    fn test_markers_survive_every_format() {
        let msg = sample();
        for format in [
            SerializationFormat::Bincode,
            SerializationFormat::Json,
            SerializationFormat::MessagePack,
        ] {
            let bytes = msg.serialize_with_header(format).expect("serialize");
            let (decoded, detected) = Message::deserialize_with_header(&bytes).expect("decode");
            assert_eq!(detected, format);
            assert_eq!(decoded, msg, "{} lost information", format.name());
        }
    }

    #[test]
    fn test_garbage_is_a_deserialize_error() {
        let result = Message::deserialize_format(&[0xFF, 0x00, 0x13], SerializationFormat::Json);
        assert!(matches!(
            result,
            Err(crate::error::ProtocolError::DeserializeError(_))
        ));
    }
}
