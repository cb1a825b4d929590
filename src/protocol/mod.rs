//! # Remote-Object Protocol
//!
//! Everything above the framed channel: messages and wire values, the
//! per-connection object table, exposure and boxing policies, the request
//! dispatcher, the connection engine, proxies and async results.
//!
//! ## Message flow
//! ```text
//! Proxy op ──► REQUEST(seq, handler, args) ──► peer dispatcher ──► RemoteObject
//!          ◄── REPLY(seq, value) | EXCEPTION(seq, error) ◄──
//! ```
//!
//! Live objects cross the wire as reference markers and come out as
//! [`proxy::Proxy`] handles on the other side; dropping the last handle
//! sends a one-way `Release` back to the owner.

pub mod async_result;
pub mod boxing;
pub mod connection;
pub mod dispatcher;
pub mod helpers;
pub mod message;
pub mod namespace;
pub mod object;
pub mod object_table;
pub mod policy;
pub mod proxy;
pub mod value;
