//! TCP transport.

use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, instrument};

use crate::config::ClientConfig;
use crate::error::{ProtocolError, Result};
use crate::protocol::connection::{Connection, ConnectionBuilder};
use crate::utils::timeout::with_timeout_error;

/// Open a TCP stream to `addr` within `timeout`
#[instrument(skip(timeout))]
pub async fn open(addr: &str, timeout: Duration) -> Result<TcpStream> {
    let stream = with_timeout_error(
        async { TcpStream::connect(addr).await.map_err(ProtocolError::from) },
        timeout,
    )
    .await?;
    stream.set_nodelay(true)?;
    debug!(peer = %addr, "TCP stream opened");
    Ok(stream)
}

/// Connect to `addr` and run the handshake
#[instrument(skip(builder, timeout))]
pub async fn connect(addr: &str, builder: ConnectionBuilder, timeout: Duration) -> Result<Connection> {
    let stream = open(addr, timeout).await?;
    builder.establish(stream).await
}

/// Connect to the configured server address. The connection timeout
/// bounds the TCP connect and the handshake together.
#[instrument(skip_all, fields(address = %config.address))]
pub async fn connect_with(config: &ClientConfig, builder: ConnectionBuilder) -> Result<Connection> {
    let address = config.address.clone();
    with_timeout_error(
        async move {
            let stream = open(&address, config.connection_timeout).await?;
            builder.establish(stream).await
        },
        config.connection_timeout,
    )
    .await
}

/// Bind a listener; pass it to [`Server::serve`](crate::service::server::Server::serve)
#[instrument]
pub async fn bind(addr: &str) -> Result<TcpListener> {
    let listener = TcpListener::bind(addr).await?;
    debug!(address = %listener.local_addr()?, "TCP listener bound");
    Ok(listener)
}
