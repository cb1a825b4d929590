//! The operations a proxy forwards to its remote object

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod common;

use std::sync::Arc;

use common::{pair, pair_with};
use netref_protocol::config::{AccessConfig, ConnectionConfig};
use netref_protocol::protocol::policy::AccessMode;
use netref_protocol::{CompareOp, Data, Namespace, ObjectRef, ProtocolError, Restricted};

fn open_access() -> ConnectionConfig {
    ConnectionConfig {
        access: AccessConfig {
            allow_setattr: true,
            allow_delattr: true,
            allow_snapshot: true,
            ..AccessConfig::default()
        },
        ..ConnectionConfig::default()
    }
}

fn settings() -> Namespace {
    Namespace::new("Settings")
        .with_attr("level", 1)
        .with_attr("name", "primary")
        .writable(true)
}

#[tokio::test]
async fn test_attribute_write_and_delete() {
    let (client, _server) = pair_with(settings(), open_access()).await;
    let root = client.root().await.unwrap();

    root.setattr("level", 7).await.unwrap();
    assert_eq!(root.getattr("level").await.unwrap(), Data::Int(7));

    root.delattr("level").await.unwrap();
    let err = root.getattr("level").await.unwrap_err();
    assert!(matches!(err, ProtocolError::Remote(ref e) if e.kind == "AttributeError"));
}

#[tokio::test]
async fn test_read_only_namespace_refuses_writes() {
    let service = Namespace::new("Frozen").with_attr("level", 1);
    let (client, _server) = pair_with(service, open_access()).await;
    let root = client.root().await.unwrap();

    let err = root.setattr("level", 2).await.unwrap_err();
    assert!(matches!(err, ProtocolError::Remote(ref e) if e.message.contains("read-only")));
}

#[tokio::test]
async fn test_items_len_and_strings() {
    let (client, _server) = pair(settings()).await;
    let root = client.root().await.unwrap();

    assert_eq!(root.getitem("name").await.unwrap(), Data::from("primary"));
    let err = root.getitem("missing").await.unwrap_err();
    assert!(matches!(err, ProtocolError::Remote(ref e) if e.kind == "KeyError"));
    assert_eq!(root.len().await.unwrap(), 2);
    assert_eq!(root.repr().await.unwrap(), "<Settings namespace>");
    assert_eq!(root.display().await.unwrap(), "<Settings namespace>");

    let err = root.setitem("name", "x").await.unwrap_err();
    assert!(matches!(err, ProtocolError::Remote(ref e) if e.kind == "TypeError"));
}

#[tokio::test]
async fn test_comparison_is_identity_on_the_owner() {
    let other: ObjectRef = Arc::new(Namespace::new("Other"));
    let service = settings().with_attr("other", Data::Object(other));
    let (client, _server) = pair(service).await;
    let root = client.root().await.unwrap();
    let other = root.getattr("other").await.unwrap();

    assert!(root.eq(Data::Proxy(root.clone())).await.unwrap());
    assert!(!root.eq(other.clone()).await.unwrap());
    assert!(root.compare(CompareOp::Ne, other).await.unwrap());
    assert!(root.lt(Data::Int(1)).await.is_err());
}

#[tokio::test]
async fn test_dir_hides_private_names_and_is_cached() {
    let (client, _server) = pair(common::calculator()).await;
    let root = client.root().await.unwrap();

    let names = root.dir().await.unwrap();
    assert_eq!(names, vec!["add", "divide", "sleep", "version"]);
    assert!(root.has_attr("add").await.unwrap());
    assert!(!root.has_attr("_secret").await.unwrap());
    assert!(!root.has_attr("multiply").await.unwrap());
}

#[tokio::test]
async fn test_restricted_mode_only_reaches_listed_names() {
    let config = ConnectionConfig {
        access: AccessConfig {
            mode: AccessMode::Restricted,
            allowed_names: vec!["stats".into()],
            ..AccessConfig::default()
        },
        ..ConnectionConfig::default()
    };
    let (client, _server) = pair_with(common::calculator(), config).await;
    let root = client.root().await.unwrap();

    assert_eq!(
        root.call_method("add", vec![Data::Int(1), Data::Int(2)], vec![])
            .await
            .unwrap(),
        Data::Int(3)
    );
    // Allowed by name but absent on the object
    let err = root.getattr("stats").await.unwrap_err();
    assert!(matches!(err, ProtocolError::Remote(_)));
    let err = root.getattr("_secret").await.unwrap_err();
    assert!(matches!(err, ProtocolError::PolicyDenied(_)));
}

#[tokio::test]
async fn test_snapshot_requires_permission() {
    let (client, _server) = pair(settings()).await;
    let root = client.root().await.unwrap();
    assert!(matches!(
        root.snapshot().await,
        Err(ProtocolError::PolicyDenied(_))
    ));

    let (client, _server) = pair_with(settings(), open_access()).await;
    let root = client.root().await.unwrap();
    let value = root.snapshot().await.unwrap();
    assert_eq!(
        value,
        Data::Map(vec![
            (Data::from("level"), Data::Int(1)),
            (Data::from("name"), Data::from("primary")),
        ])
    );
}

#[tokio::test]
async fn test_listed_types_travel_by_value() {
    let service = Namespace::new("Geometry").with_method("origin", |_| {
        Ok(Data::object(
            Namespace::new("Point").with_attr("x", 0).with_attr("y", 0),
        ))
    });
    let config = ConnectionConfig {
        by_value_types: vec!["Point".into()],
        ..ConnectionConfig::default()
    };
    let (client, server) = pair_with(service, config).await;
    let root = client.root().await.unwrap();

    let origin = root.call_method("origin", vec![], vec![]).await.unwrap();
    assert_eq!(
        origin,
        Data::Map(vec![
            (Data::from("x"), Data::Int(0)),
            (Data::from("y"), Data::Int(0)),
        ])
    );
    assert_eq!(server.object_count(), 1, "by-value results are not tracked");
}

#[tokio::test]
async fn test_restricted_wrapper() {
    let inner: ObjectRef = Arc::new(
        Namespace::new("Account")
            .with_attr("owner", "ada")
            .with_attr("balance", 10)
            .with_attr("pin", 1234)
            .with_method("statement", |_| Ok(Data::from("ok")))
            .writable(true),
    );
    let service = Restricted::new(inner, ["owner", "balance", "statement"]).with_writable(["balance"]);
    let server = netref_protocol::ConnectionBuilder::new(open_access()).service(service);
    let (client, _server) =
        netref_protocol::transport::memory::connect_pair(Default::default(), server)
            .await
            .unwrap();
    let root = client.root().await.unwrap();

    assert_eq!(root.type_info().name, "Account");
    assert_eq!(root.getattr("owner").await.unwrap(), Data::from("ada"));
    assert_eq!(
        root.call_method("statement", vec![], vec![]).await.unwrap(),
        Data::from("ok")
    );
    let err = root.getattr("pin").await.unwrap_err();
    assert!(matches!(err, ProtocolError::Remote(ref e) if e.kind == "AttributeError"));

    root.setattr("balance", 20).await.unwrap();
    assert_eq!(root.getattr("balance").await.unwrap(), Data::Int(20));
    assert!(root.setattr("owner", "eve").await.is_err());
    assert_eq!(
        root.dir().await.unwrap(),
        vec!["balance", "owner", "statement"]
    );
}

#[tokio::test]
async fn test_proxy_from_another_connection_is_rejected() {
    let (first, _s1) = pair(settings()).await;
    let echo = Namespace::new("Echo").with_method("echo", |args| {
        Ok(args.into_iter().next().unwrap_or_default())
    });
    let (second, _s2) = pair(echo).await;

    let foreign = first.root().await.unwrap();
    let root = second.root().await.unwrap();

    let local = Data::object(Namespace::new("Local"));
    let err = root
        .call_method("echo", vec![local, Data::Proxy(foreign)], vec![])
        .await
        .unwrap_err();
    assert!(matches!(err, ProtocolError::ForeignProxy));
    assert_eq!(second.object_count(), 0, "partial boxing was rolled back");
    second.ping().await.unwrap();
}

#[tokio::test]
async fn test_root_is_fetched_once() {
    let (client, server) = pair(settings()).await;
    let first = client.root().await.unwrap();
    let second = client.root().await.unwrap();

    assert!(first.same_object(&second));
    assert_eq!(server.ref_count(first.id()), Some(1));
    assert!(first.belongs_to(&client));
}

#[tokio::test]
async fn test_bound_method_is_callable() {
    let (client, _server) = pair(common::calculator()).await;
    let root = client.root().await.unwrap();

    let add = root.getattr("add").await.unwrap().into_proxy().unwrap();
    assert_eq!(add.type_info().name, "function");
    assert_eq!(
        add.call(vec![Data::Int(4), Data::Int(5)], vec![]).await.unwrap(),
        Data::Int(9)
    );
    assert_eq!(add.repr().await.unwrap(), "<function Calculator.add>");
}

#[tokio::test]
async fn test_keyword_arguments_reach_the_method() {
    let service = Namespace::new("Kw").with_async_method("greet", |_ctx, args, kwargs| async move {
        let name = args.first().and_then(|a| a.as_str().map(str::to_owned)).unwrap_or_default();
        let punct = kwargs
            .iter()
            .find(|(k, _)| k == "punct")
            .and_then(|(_, v)| v.as_str().map(str::to_owned))
            .unwrap_or_else(|| ".".into());
        Ok(Data::Str(format!("hello {name}{punct}")))
    });
    let (client, _server) = pair(service).await;
    let root = client.root().await.unwrap();

    let greeting = root
        .call_method(
            "greet",
            vec![Data::from("ada")],
            vec![("punct".into(), Data::from("!"))],
        )
        .await
        .unwrap();
    assert_eq!(greeting, Data::from("hello ada!"));
}
