//! Server accept loop over real sockets

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod common;

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::{bounded, eventually};
use netref_protocol::config::{ClientConfig, ExecutionPolicy, ServerConfig};
use netref_protocol::transport::tcp;
use netref_protocol::{ConnectionBuilder, Data, Namespace, ObjectRef, Server};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

fn server_config(execution: ExecutionPolicy) -> ServerConfig {
    ServerConfig {
        address: "127.0.0.1:0".into(),
        max_connections: 16,
        shutdown_timeout: Duration::from_secs(1),
        execution,
    }
}

/// Every connection gets a `Session` root with its own id
fn session_server(config: ServerConfig) -> Server {
    let next = Arc::new(AtomicI64::new(1));
    Server::new(config, ConnectionBuilder::default()).with_factory(move || -> ObjectRef {
        let id = next.fetch_add(1, Ordering::SeqCst);
        Arc::new(
            Namespace::new("Session")
                .with_attr("id", id)
                .with_method("echo", |args| Ok(Data::List(args))),
        )
    })
}

async fn start(server: Server) -> (Arc<Server>, String, tokio::task::JoinHandle<()>) {
    let listener = tcp::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    let server = Arc::new(server);
    let running = server.clone();
    let handle = tokio::spawn(async move {
        running.serve(listener).await.unwrap();
    });
    (server, address, handle)
}

async fn session_id(address: &str) -> (netref_protocol::Connection, Data) {
    let conn = tcp::connect(address, ConnectionBuilder::default(), CONNECT_TIMEOUT)
        .await
        .unwrap();
    let root = conn.root().await.unwrap();
    let id = root.getattr("id").await.unwrap();
    (conn, id)
}

#[tokio::test]
async fn test_each_connection_gets_its_own_service() {
    let (server, address, handle) = start(session_server(server_config(ExecutionPolicy::Shared))).await;

    let (first, first_id) = session_id(&address).await;
    let (second, second_id) = session_id(&address).await;
    assert_ne!(first_id, second_id);
    eventually(|| server.connections().len() == 2).await;

    let root = first.root().await.unwrap();
    let echoed = root
        .call_method("echo", vec![Data::Int(1), Data::from("two")], vec![])
        .await
        .unwrap();
    assert_eq!(echoed, Data::List(vec![Data::Int(1), Data::from("two")]));

    first.close();
    second.close();
    eventually(|| server.active_connections() == 0).await;

    server.shutdown();
    bounded(handle).await.unwrap();
}

#[tokio::test]
async fn test_client_config_drives_the_connect() {
    let (server, address, handle) = start(session_server(server_config(ExecutionPolicy::Shared))).await;
    let config = ClientConfig {
        address: address.clone(),
        connection_timeout: CONNECT_TIMEOUT,
    };

    let conn = tcp::connect_with(&config, ConnectionBuilder::default()).await.unwrap();
    let root = conn.root().await.unwrap();
    assert_eq!(root.getattr("id").await.unwrap(), Data::Int(1));
    conn.close();

    server.shutdown();
    bounded(handle).await.unwrap();
    let refused = tcp::connect_with(&config, ConnectionBuilder::default()).await;
    assert!(refused.is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_pinned_connections_run_on_their_own_threads() {
    let service = Namespace::new("Threads").with_method("thread", |_| {
        let name = std::thread::current().name().unwrap_or_default().to_string();
        Ok(Data::Str(name))
    });
    let server = Server::new(
        server_config(ExecutionPolicy::Pinned),
        ConnectionBuilder::default().service(service),
    );
    let (server, address, handle) = start(server).await;

    let conn = tcp::connect(&address, ConnectionBuilder::default(), CONNECT_TIMEOUT)
        .await
        .unwrap();
    let root = conn.root().await.unwrap();
    let thread = root.call_method("thread", vec![], vec![]).await.unwrap();
    let thread = thread.as_str().unwrap().to_string();
    assert!(thread.starts_with("netref-conn-"), "served on {thread}");

    conn.close();
    eventually(|| server.active_connections() == 0).await;
    server.shutdown();
    bounded(handle).await.unwrap();
}

#[tokio::test]
async fn test_connection_limit_rejects_extra_clients() {
    let mut config = server_config(ExecutionPolicy::Shared);
    config.max_connections = 1;
    let (server, address, handle) = start(session_server(config)).await;

    let (first, _) = session_id(&address).await;
    let rejected = tcp::connect(&address, ConnectionBuilder::default(), CONNECT_TIMEOUT).await;
    assert!(rejected.is_err());
    assert!(first.ping().await.is_ok());

    first.close();
    eventually(|| server.active_connections() == 0).await;
    let (again, _) = session_id(&address).await;
    again.close();

    server.shutdown();
    bounded(handle).await.unwrap();
}

#[tokio::test]
async fn test_shutdown_closes_lingering_connections() {
    let (server, address, handle) = start(session_server(server_config(ExecutionPolicy::Shared))).await;
    let (conn, _) = session_id(&address).await;
    eventually(|| server.connections().len() == 1).await;

    server.shutdown();
    tokio::time::timeout(Duration::from_secs(3), handle)
        .await
        .unwrap()
        .unwrap();
    bounded(conn.closed()).await;
    assert!(tcp::connect(&address, ConnectionBuilder::default(), CONNECT_TIMEOUT)
        .await
        .is_err());
}

#[cfg(unix)]
#[tokio::test]
async fn test_unix_socket_transport() {
    use netref_protocol::transport::local::{self, LocalListener};

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("netref.sock");
    let listener = LocalListener::bind(&path).await.unwrap();

    let server = Arc::new(session_server(server_config(ExecutionPolicy::Shared)));
    let running = server.clone();
    let handle = tokio::spawn(async move {
        running.serve(listener).await.unwrap();
    });

    let conn = local::connect(&path, ConnectionBuilder::default()).await.unwrap();
    let root = conn.root().await.unwrap();
    assert_eq!(root.getattr("id").await.unwrap(), Data::Int(1));
    assert_eq!(conn.peer_service(), netref_protocol::config::DEFAULT_SERVICE_NAME);

    conn.close();
    server.shutdown();
    bounded(handle).await.unwrap();
    assert!(!path.exists(), "socket file removed with the listener");
}
