//! In-process transport over a tokio duplex pipe.

use crate::error::Result;
use crate::protocol::connection::{Connection, ConnectionBuilder};

/// Buffer size of each direction of the pipe
pub const PIPE_CAPACITY: usize = 64 * 1024;

/// Build two connected peers in the same process.
///
/// Both handshakes run concurrently; returns `(client, server)`.
pub async fn connect_pair(
    client: ConnectionBuilder,
    server: ConnectionBuilder,
) -> Result<(Connection, Connection)> {
    let (a, b) = tokio::io::duplex(PIPE_CAPACITY);
    let (client, server) = tokio::join!(client.establish(a), server.establish(b));
    Ok((client?, server?))
}
