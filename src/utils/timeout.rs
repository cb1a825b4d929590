//! Timeout constants and async timeout wrappers.

use std::future::Future;
use std::time::Duration;

use crate::error::{ProtocolError, Result};

/// Default bound for synchronous requests and connection attempts
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Bound on the HELLO exchange
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Grace period for in-flight connections during server shutdown
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Await `fut`, mapping an elapsed deadline to [`ProtocolError::Timeout`]
pub async fn with_timeout_error<F, T>(fut: F, duration: Duration) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(duration, fut).await {
        Ok(result) => result,
        Err(_) => Err(ProtocolError::Timeout),
    }
}

/// Await `fut`, returning `None` if the deadline elapses
pub async fn with_timeout<F, T>(fut: F, duration: Duration) -> Option<T>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(duration, fut).await.ok()
}
