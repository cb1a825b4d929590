//! # Server
//!
//! Accepts byte streams and turns each into a protocol
//! [`Connection`]. Every connection gets the root service produced by the
//! server's [`ServiceFactory`] (or the builder's shared root when no factory
//! is set).
//!
//! ## Execution policies
//! - `Shared`: connection tasks run on the runtime that accepted them
//! - `Pinned`: each connection runs on a dedicated OS thread with its own
//!   current-thread runtime, so a blocking service cannot starve the others
//!
//! ## Shutdown
//! [`Server::shutdown`] stops accepting, waits up to
//! `shutdown_timeout` for clients to disconnect and then closes whatever is
//! left.

use async_trait::async_trait;
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::{ExecutionPolicy, ServerConfig};
use crate::error::Result;
use crate::protocol::connection::{Connection, ConnectionBuilder};
use crate::protocol::object::ObjectRef;
use crate::transport::tcp;
use crate::utils::metrics::global_metrics;

#[cfg(unix)]
use crate::transport::local::LocalListener;
#[cfg(unix)]
use tokio::net::UnixStream;

/// How often shutdown re-checks the number of live connections
const DRAIN_POLL: Duration = Duration::from_millis(50);

/// Produces the root service for each accepted connection
pub trait ServiceFactory: Send + Sync + 'static {
    fn create(&self) -> ObjectRef;
}

impl<F> ServiceFactory for F
where
    F: Fn() -> ObjectRef + Send + Sync + 'static,
{
    fn create(&self) -> ObjectRef {
        self()
    }
}

/// Listener the accept loop can drive.
///
/// `detach`/`attach` move an accepted stream off the accepting runtime so a
/// pinned connection can re-register it with its own.
#[async_trait]
pub trait Acceptor: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static;
    type Detached: Send + 'static;

    async fn accept_stream(&self) -> io::Result<(Self::Stream, String)>;

    fn detach(stream: Self::Stream) -> io::Result<Self::Detached>;

    fn attach(detached: Self::Detached) -> io::Result<Self::Stream>;
}

#[async_trait]
impl Acceptor for TcpListener {
    type Stream = TcpStream;
    type Detached = std::net::TcpStream;

    async fn accept_stream(&self) -> io::Result<(TcpStream, String)> {
        let (stream, peer) = self.accept().await?;
        stream.set_nodelay(true)?;
        Ok((stream, peer.to_string()))
    }

    fn detach(stream: TcpStream) -> io::Result<std::net::TcpStream> {
        stream.into_std()
    }

    fn attach(detached: std::net::TcpStream) -> io::Result<TcpStream> {
        TcpStream::from_std(detached)
    }
}

#[cfg(unix)]
#[async_trait]
impl Acceptor for LocalListener {
    type Stream = UnixStream;
    type Detached = std::os::unix::net::UnixStream;

    async fn accept_stream(&self) -> io::Result<(UnixStream, String)> {
        let stream = self
            .accept()
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
        Ok((stream, self.path().display().to_string()))
    }

    fn detach(stream: UnixStream) -> io::Result<std::os::unix::net::UnixStream> {
        stream.into_std()
    }

    fn attach(detached: std::os::unix::net::UnixStream) -> io::Result<UnixStream> {
        UnixStream::from_std(detached)
    }
}

type Registry = Arc<Mutex<HashMap<u64, Connection>>>;

/// Decrements the live-connection count when a connection task ends
struct ActiveGuard(Arc<AtomicUsize>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct Server {
    config: ServerConfig,
    builder: ConnectionBuilder,
    factory: Option<Arc<dyn ServiceFactory>>,
    shutdown: CancellationToken,
    active: Arc<AtomicUsize>,
    connections: Registry,
}

impl Server {
    pub fn new(config: ServerConfig, builder: ConnectionBuilder) -> Self {
        Self {
            config,
            builder,
            factory: None,
            shutdown: CancellationToken::new(),
            active: Arc::new(AtomicUsize::new(0)),
            connections: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Give every connection its own root service
    pub fn with_factory<F: ServiceFactory>(mut self, factory: F) -> Self {
        self.factory = Some(Arc::new(factory));
        self
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Connections accepted and not yet finished (handshakes included)
    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Established connections, for inspection or broadcast
    pub fn connections(&self) -> Vec<Connection> {
        lock(&self.connections).values().cloned().collect()
    }

    /// Stop accepting and begin the graceful drain
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Bind `config.address` and serve until CTRL+C or [`Server::shutdown`]
    #[instrument(skip(self), fields(address = %self.config.address))]
    pub async fn run(&self) -> Result<()> {
        let listener = tcp::bind(&self.config.address).await?;

        let token = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                signal = tokio::signal::ctrl_c() => {
                    if signal.is_ok() {
                        info!("Received CTRL+C signal, shutting down");
                        token.cancel();
                    }
                }
            }
        });

        self.serve(listener).await
    }

    /// Accept connections from `acceptor` until shutdown, then drain
    pub async fn serve<A: Acceptor>(&self, acceptor: A) -> Result<()> {
        info!(
            max_connections = self.config.max_connections,
            execution = ?self.config.execution,
            "Server accepting connections"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = acceptor.accept_stream() => match accepted {
                    Ok((stream, peer)) => self.admit::<A>(stream, peer),
                    Err(e) => error!(error = %e, "Error accepting connection"),
                }
            }
        }

        drop(acceptor);
        self.drain().await;
        Ok(())
    }

    fn admit<A: Acceptor>(&self, stream: A::Stream, peer: String) {
        let active = self.active.fetch_add(1, Ordering::SeqCst);
        let guard = ActiveGuard(self.active.clone());
        if active >= self.config.max_connections {
            warn!(peer = %peer, limit = self.config.max_connections, "Connection limit reached, rejecting");
            drop(stream);
            return;
        }

        let mut builder = self.builder.clone();
        if let Some(factory) = &self.factory {
            builder = builder.service_ref(factory.create());
        }
        let connections = self.connections.clone();

        match self.config.execution {
            ExecutionPolicy::Shared => {
                tokio::spawn(async move {
                    let _guard = guard;
                    serve_connection(builder, stream, peer, connections).await;
                });
            }
            ExecutionPolicy::Pinned => {
                let detached = match A::detach(stream) {
                    Ok(detached) => detached,
                    Err(e) => {
                        error!(error = %e, peer = %peer, "Failed to detach stream");
                        return;
                    }
                };
                let spawned = std::thread::Builder::new()
                    .name(format!("netref-conn-{peer}"))
                    .spawn(move || {
                        let _guard = guard;
                        run_pinned::<A>(builder, detached, peer, connections);
                    });
                if let Err(e) = spawned {
                    error!(error = %e, "Failed to spawn connection thread");
                }
            }
        }
    }

    async fn drain(&self) {
        info!("Shutting down server. Waiting for connections to close...");

        let deadline = tokio::time::sleep(self.config.shutdown_timeout);
        tokio::pin!(deadline);

        loop {
            if self.active_connections() == 0 {
                info!("All connections closed, shutting down");
                global_metrics().log_metrics();
                return;
            }
            tokio::select! {
                _ = &mut deadline => {
                    warn!(
                        connections = self.active_connections(),
                        "Shutdown timeout reached, closing remaining connections"
                    );
                    break;
                }
                _ = tokio::time::sleep(DRAIN_POLL) => {}
            }
        }

        for conn in self.connections() {
            conn.close();
        }
        global_metrics().log_metrics();
    }
}

fn run_pinned<A: Acceptor>(
    builder: ConnectionBuilder,
    detached: A::Detached,
    peer: String,
    connections: Registry,
) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "Failed to build connection runtime");
            return;
        }
    };

    runtime.block_on(async move {
        match A::attach(detached) {
            Ok(stream) => serve_connection(builder, stream, peer, connections).await,
            Err(e) => error!(error = %e, "Failed to attach stream"),
        }
    });
}

async fn serve_connection<S>(builder: ConnectionBuilder, stream: S, peer: String, connections: Registry)
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let conn = match builder.establish(stream).await {
        Ok(conn) => conn,
        Err(e) => {
            warn!(peer = %peer, error = %e, "Connection setup failed");
            return;
        }
    };

    info!(conn_id = conn.id(), peer = %peer, "New connection established");
    lock(&connections).insert(conn.id(), conn.clone());

    conn.closed().await;

    lock(&connections).remove(&conn.id());
    debug!(conn_id = conn.id(), peer = %peer, "Connection closed");
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
