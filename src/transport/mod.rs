//! # Transports
//!
//! Byte streams a [`Connection`](crate::protocol::connection::Connection) can
//! run over. Any `AsyncRead + AsyncWrite` stream works; these modules cover
//! the common ones.
//!
//! - **tcp**: TCP client connect and listener bind
//! - **local**: Unix domain sockets (Unix only)
//! - **memory**: in-process duplex pipe, used by tests and embedded peers

#[cfg(unix)]
pub mod local;
pub mod memory;
pub mod tcp;
