//! Unix domain socket transport.
//!
//! Binding removes a stale socket file left by a previous run; the
//! [`LocalListener`] guard removes its own file when dropped.

use std::path::{Path, PathBuf};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, error, info, instrument};

use crate::error::Result;
use crate::protocol::connection::{Connection, ConnectionBuilder};

/// Connect to the socket at `path` and run the handshake
#[instrument(skip(path, builder), fields(socket_path = %path.as_ref().display()))]
pub async fn connect<P: AsRef<Path>>(path: P, builder: ConnectionBuilder) -> Result<Connection> {
    let stream = UnixStream::connect(path).await?;
    builder.establish(stream).await
}

/// Bound Unix listener that cleans up its socket file
#[derive(Debug)]
pub struct LocalListener {
    listener: UnixListener,
    path: PathBuf,
}

impl LocalListener {
    /// Bind at `path`, replacing a stale socket file
    #[instrument(skip(path), fields(socket_path = %path.as_ref().display()))]
    pub async fn bind<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if path.exists() {
            debug!(path = %path.display(), "Removing stale socket file");
            tokio::fs::remove_file(&path).await.ok();
        }

        let listener = UnixListener::bind(&path)?;
        info!(path = %path.display(), "Listening on unix socket");
        Ok(Self { listener, path })
    }

    pub async fn accept(&self) -> Result<UnixStream> {
        let (stream, _) = self.listener.accept().await?;
        Ok(stream)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LocalListener {
    fn drop(&mut self) {
        if !self.path.exists() {
            return;
        }
        if let Err(e) = std::fs::remove_file(&self.path) {
            error!(error = %e, path = %self.path.display(), "Failed to remove socket file");
        } else {
            debug!(path = %self.path.display(), "Removed socket file");
        }
    }
}
