//! # Services
//!
//! Long-running acceptors that hand each incoming stream to the protocol
//! engine.

pub mod server;
