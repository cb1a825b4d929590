//! # Core Protocol Components
//!
//! Low-level framing and message encoding.
//!
//! This module turns a reliable byte stream into discrete frames and frames
//! into protocol messages.
//!
//! ## Components
//! - **Packet**: one length-delimited frame with magic bytes and a version byte
//! - **Codec**: Tokio codec for framing over byte streams (the framed channel)
//! - **Serialization**: pluggable message encoding (bincode, JSON, MessagePack)
//!
//! ## Wire Format
//! ```text
//! [Magic(4)] [Version(1)] [Length(4)] [Payload(N)]
//! ```
//!
//! ## Limits
//! - Maximum payload size defaults to 16MB and is configurable per connection
//! - Length is validated before any allocation

pub mod codec;
pub mod packet;
pub mod serialization;
