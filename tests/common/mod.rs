//! Shared fixtures for the connection-level integration tests

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use netref_protocol::config::{ConnectionConfig, RequestHandling};
use netref_protocol::transport::memory::connect_pair;
use netref_protocol::{Connection, ConnectionBuilder, Data, Namespace, RemoteError};

/// Client/server pair where the server exposes `service`
pub async fn pair(service: Namespace) -> (Connection, Connection) {
    pair_with(service, ConnectionConfig::default()).await
}

pub async fn pair_with(service: Namespace, server_config: ConnectionConfig) -> (Connection, Connection) {
    let server = ConnectionBuilder::new(server_config).service(service);
    connect_pair(ConnectionBuilder::default(), server)
        .await
        .expect("in-memory pair")
}

pub fn concurrent() -> ConnectionConfig {
    ConnectionConfig {
        request_handling: RequestHandling::Concurrent,
        ..ConnectionConfig::default()
    }
}

/// Poll `check` until it holds or two seconds pass
pub async fn eventually<F>(mut check: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !check() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Await `fut`, failing the test if it takes more than two seconds
pub async fn bounded<F: Future>(fut: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(2), fut)
        .await
        .expect("operation did not finish in time")
}

/// Service recording the order in which `record` calls arrive
pub fn recorder() -> (Namespace, Arc<Mutex<Vec<Data>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let log = seen.clone();
    let service = Namespace::new("Recorder").with_method("record", move |args| {
        let item = args.into_iter().next().unwrap_or_default();
        log.lock().unwrap().push(item);
        Ok(Data::None)
    });
    (service, seen)
}

/// Calculator-style service used across the suites
pub fn calculator() -> Namespace {
    Namespace::new("Calculator")
        .with_attr("version", 3)
        .with_attr("_secret", "hunter2")
        .with_method("add", |args| {
            let a = args.first().and_then(Data::as_int).unwrap_or(0);
            let b = args.get(1).and_then(Data::as_int).unwrap_or(0);
            Ok(Data::Int(a + b))
        })
        .with_method("divide", |args| {
            let a = args.first().and_then(Data::as_int).unwrap_or(0);
            match args.get(1).and_then(Data::as_int) {
                Some(0) | None => Err(RemoteError::new("ZeroDivisionError", "division by zero")),
                Some(b) => Ok(Data::Int(a / b)),
            }
        })
        .with_async_method("sleep", |_ctx, args, _kwargs| async move {
            let ms = args.first().and_then(Data::as_int).unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(ms as u64)).await;
            Ok(Data::Int(ms))
        })
}
