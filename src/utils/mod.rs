//! # Utility Modules
//!
//! Supporting utilities shared by the protocol and service layers.
//!
//! ## Components
//! - **Logging**: tracing-subscriber setup from [`LoggingConfig`](crate::config::LoggingConfig)
//! - **Metrics**: Thread-safe observability counters
//! - **Timeout**: Timeout constants and async wrappers

pub mod logging;
pub mod metrics;
pub mod timeout;
