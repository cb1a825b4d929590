//! # netref-protocol
//!
//! Transparent remote-object protocol. Two peers share one framed byte
//! stream; each can expose local objects and operate on the other's objects
//! through [`Proxy`] handles as if they were local.
//!
//! ## Layers
//! - **core**: frame format, tokio codec, message serialization
//! - **protocol**: messages, object table, policies, connection engine,
//!   proxies and async results
//! - **transport**: TCP, Unix sockets and in-memory pipes
//! - **service**: connection acceptor with execution policies
//! - **utils**: logging, metrics and timeout helpers
//!
//! ## Example
//! ```rust,no_run
//! use netref_protocol::{transport, ConnectionBuilder, Data};
//! use std::time::Duration;
//!
//! # async fn demo() -> netref_protocol::Result<()> {
//! let conn = transport::tcp::connect(
//!     "127.0.0.1:18812",
//!     ConnectionBuilder::default(),
//!     Duration::from_secs(5),
//! )
//! .await?;
//! let root = conn.root().await?;
//! let sum = root
//!     .call_method("add", vec![Data::Int(2), Data::Int(3)], vec![])
//!     .await?;
//! assert_eq!(sum, Data::Int(5));
//! conn.close();
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod protocol;
pub mod service;
pub mod transport;
pub mod utils;

pub use crate::config::{ConnectionConfig, NetworkConfig, RequestHandling};
pub use crate::core::packet::Packet;
pub use crate::error::{ErrorCategory, ProtocolError, Result};
pub use crate::protocol::async_result::{AsyncResult, ResultState};
pub use crate::protocol::boxing::{BoxingPolicy, ReferenceAll, ValueTypes};
pub use crate::protocol::connection::{Connection, ConnectionBuilder, ConnectionState};
pub use crate::protocol::helpers::{async_, buffiter, timed, AsyncProxy, TimedProxy};
pub use crate::protocol::message::{CompareOp, Handler};
pub use crate::protocol::namespace::{Function, Namespace, RemoteIter};
pub use crate::protocol::object::{CallContext, Data, ObjectRef, RemoteError, RemoteObject};
pub use crate::protocol::policy::{AccessMode, DefaultPolicy, ExposurePolicy, Operation, Restricted};
pub use crate::protocol::proxy::Proxy;
pub use crate::service::server::{Server, ServiceFactory};
