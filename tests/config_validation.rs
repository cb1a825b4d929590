//! Integration tests for configuration validation and loading

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use netref_protocol::config::{
    AccessConfig, ClientConfig, ConnectionConfig, ExecutionPolicy, LoggingConfig, NetworkConfig,
    RequestHandling, ServerConfig, TransportConfig,
};
use netref_protocol::core::serialization::SerializationFormat;
use netref_protocol::protocol::policy::AccessMode;
use serial_test::serial;
use std::time::Duration;
use tracing::Level;

#[test]
fn test_default_config_validates() {
    let config = NetworkConfig::default();
    let errors = config.validate();
    assert!(
        errors.is_empty(),
        "Default config should be valid, but got errors: {:?}",
        errors
    );
}

#[test]
fn test_invalid_server_address() {
    let mut config = NetworkConfig::default();
    config.server.address = "invalid_address".to_string();

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("Invalid server address")));
}

#[test]
fn test_empty_server_address() {
    let mut config = NetworkConfig::default();
    config.server.address = String::new();

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("cannot be empty")));
}

#[test]
fn test_zero_max_connections() {
    let mut config = NetworkConfig::default();
    config.server.max_connections = 0;

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("Max connections must be greater than 0")));
}

#[test]
fn test_high_max_connections_warning() {
    let mut config = NetworkConfig::default();
    config.server.max_connections = 150_000;

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("Max connections very high")));
}

#[test]
fn test_shutdown_timeout_bounds() {
    let mut config = NetworkConfig::default();
    config.server.shutdown_timeout = Duration::from_millis(200);
    assert!(config
        .validate()
        .iter()
        .any(|e| e.contains("Shutdown timeout too short")));

    config.server.shutdown_timeout = Duration::from_secs(120);
    assert!(config
        .validate()
        .iter()
        .any(|e| e.contains("Shutdown timeout too long")));
}

#[test]
fn test_invalid_client_address() {
    let mut config = NetworkConfig::default();
    config.client.address = "not:a:valid:address".to_string();

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("Invalid client address")));
}

#[test]
fn test_short_connection_timeout() {
    let mut config = NetworkConfig::default();
    config.client.connection_timeout = Duration::from_millis(50);

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("Connection timeout too short")));
}

#[test]
fn test_request_and_handshake_timeouts() {
    let mut config = NetworkConfig::default();
    config.connection.sync_request_timeout = Duration::from_millis(1);
    config.connection.handshake_timeout = Duration::from_millis(10);

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("Request timeout too short")));
    assert!(errors
        .iter()
        .any(|e| e.contains("Handshake timeout too short")));
}

#[test]
fn test_keepalive_interval_bounds() {
    let mut config = NetworkConfig::default();
    config.connection.keepalive_interval = Some(Duration::from_millis(10));
    assert!(config
        .validate()
        .iter()
        .any(|e| e.contains("Keepalive interval too short")));

    config.connection.keepalive_interval = Some(Duration::from_secs(7200));
    assert!(config
        .validate()
        .iter()
        .any(|e| e.contains("Keepalive interval too long")));

    config.connection.keepalive_interval = None;
    assert!(config.validate().is_empty());
}

#[test]
fn test_zero_concurrent_requests() {
    let mut config = NetworkConfig::default();
    config.connection.max_concurrent_requests = 0;

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("Max concurrent requests must be greater than 0")));
}

#[test]
fn test_empty_service_name() {
    let mut config = NetworkConfig::default();
    config.connection.service_name = String::new();

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("Service name cannot be empty")));
}

#[test]
fn test_allowed_names_ignored_when_unrestricted() {
    let mut config = NetworkConfig::default();
    config.connection.access.mode = AccessMode::Unrestricted;
    config.connection.access.allowed_names = vec!["add".into()];

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("allowed_names has no effect")));
}

#[test]
fn test_zero_max_payload_size() {
    let mut config = NetworkConfig::default();
    config.transport.max_payload_size = 0;

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("Max payload size cannot be 0")));
}

#[test]
fn test_tiny_max_payload_size() {
    let mut config = NetworkConfig::default();
    config.transport.max_payload_size = 512;

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("Max payload size too small")));
}

#[test]
fn test_excessive_max_payload_size() {
    let mut config = NetworkConfig::default();
    config.transport.max_payload_size = 200 * 1024 * 1024;

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("Max payload size too large")));
}

#[test]
fn test_empty_app_name() {
    let mut config = NetworkConfig::default();
    config.logging.app_name = String::new();

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("Application name cannot be empty")));
}

#[test]
fn test_long_app_name() {
    let mut config = NetworkConfig::default();
    config.logging.app_name = "a".repeat(100);

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("Application name too long")));
}

#[test]
fn test_log_to_file_without_path() {
    let mut config = NetworkConfig::default();
    config.logging.log_to_file = true;
    config.logging.log_file_path = None;

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("log_file_path must be specified")));
}

#[test]
fn test_no_logging_outputs() {
    let mut config = NetworkConfig::default();
    config.logging.log_to_console = false;
    config.logging.log_to_file = false;

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("At least one logging output")));
}

#[test]
fn test_validate_strict_with_valid_config() {
    let config = NetworkConfig::default();
    assert!(config.validate_strict().is_ok());
}

#[test]
fn test_validate_strict_with_invalid_config() {
    let mut config = NetworkConfig::default();
    config.server.address = String::new();

    let err = config.validate_strict().unwrap_err();
    assert!(err.to_string().contains("Configuration validation failed"));
}

#[test]
fn test_multiple_validation_errors() {
    let mut config = NetworkConfig::default();

    config.server.address = String::new();
    config.server.max_connections = 0;
    config.client.address = String::new();
    config.transport.max_payload_size = 0;
    config.logging.app_name = String::new();

    let errors = config.validate();
    assert!(
        errors.len() >= 5,
        "Expected at least 5 errors, got {}: {:?}",
        errors.len(),
        errors
    );
}

#[test]
fn test_valid_production_config() {
    let config = NetworkConfig {
        server: ServerConfig {
            address: "0.0.0.0:18812".to_string(),
            max_connections: 10_000,
            shutdown_timeout: Duration::from_secs(10),
            execution: ExecutionPolicy::Pinned,
        },
        client: ClientConfig {
            address: "10.0.0.5:18812".to_string(),
            connection_timeout: Duration::from_secs(10),
        },
        connection: ConnectionConfig {
            sync_request_timeout: Duration::from_secs(30),
            keepalive_interval: Some(Duration::from_secs(15)),
            request_handling: RequestHandling::Concurrent,
            format: SerializationFormat::MessagePack,
            access: AccessConfig {
                mode: AccessMode::Restricted,
                allowed_names: vec!["query".into(), "version".into()],
                ..AccessConfig::default()
            },
            service_name: "InventoryService".to_string(),
            ..ConnectionConfig::default()
        },
        transport: TransportConfig {
            max_payload_size: 16 * 1024 * 1024,
        },
        logging: LoggingConfig {
            app_name: "inventory".to_string(),
            log_level: Level::INFO,
            log_to_console: true,
            log_to_file: false,
            log_file_path: None,
            json_format: true,
        },
    };

    let errors = config.validate();
    assert!(errors.is_empty(), "Production config should be valid, got: {:?}", errors);
}

#[test]
fn test_file_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("netref.toml");

    let config = NetworkConfig::default_with_overrides(|c| {
        c.connection.service_name = "FileService".into();
        c.connection.request_handling = RequestHandling::Concurrent;
        c.server.execution = ExecutionPolicy::Pinned;
    });
    config.save_to_file(&path).unwrap();

    let loaded = NetworkConfig::from_file(&path).unwrap();
    assert_eq!(loaded.connection.service_name, "FileService");
    assert_eq!(loaded.connection.request_handling, RequestHandling::Concurrent);
    assert_eq!(loaded.server.execution, ExecutionPolicy::Pinned);
}

#[test]
fn test_missing_file_is_config_error() {
    let err = NetworkConfig::from_file("/nonexistent/netref.toml").unwrap_err();
    assert!(err.to_string().contains("Failed to open config file"));
}

#[test]
fn test_example_config_parses() {
    let example = NetworkConfig::example_config();
    let parsed = NetworkConfig::from_toml(&example).unwrap();
    assert!(parsed.validate().is_empty());
}

const ENV_VARS: &[&str] = &[
    "NETREF_SERVER_ADDRESS",
    "NETREF_MAX_CONNECTIONS",
    "NETREF_REQUEST_TIMEOUT_MS",
    "NETREF_KEEPALIVE_INTERVAL_MS",
    "NETREF_ACCESS_MODE",
    "NETREF_REQUEST_HANDLING",
    "NETREF_LOG_LEVEL",
];

fn clear_env() {
    for var in ENV_VARS {
        std::env::remove_var(var);
    }
}

#[test]
#[serial]
fn test_env_overrides() {
    clear_env();
    std::env::set_var("NETREF_SERVER_ADDRESS", "127.0.0.1:9000");
    std::env::set_var("NETREF_MAX_CONNECTIONS", "42");
    std::env::set_var("NETREF_REQUEST_TIMEOUT_MS", "2500");
    std::env::set_var("NETREF_KEEPALIVE_INTERVAL_MS", "0");
    std::env::set_var("NETREF_ACCESS_MODE", "Restricted");
    std::env::set_var("NETREF_REQUEST_HANDLING", "concurrent");
    std::env::set_var("NETREF_LOG_LEVEL", "debug");

    let config = NetworkConfig::from_env().unwrap();
    clear_env();

    assert_eq!(config.server.address, "127.0.0.1:9000");
    assert_eq!(config.server.max_connections, 42);
    assert_eq!(
        config.connection.sync_request_timeout,
        Duration::from_millis(2500)
    );
    assert_eq!(config.connection.keepalive_interval, None);
    assert_eq!(config.connection.access.mode, AccessMode::Restricted);
    assert_eq!(
        config.connection.request_handling,
        RequestHandling::Concurrent
    );
    assert_eq!(config.logging.log_level, Level::DEBUG);
}

#[test]
#[serial]
fn test_env_rejects_bad_values() {
    clear_env();
    std::env::set_var("NETREF_MAX_CONNECTIONS", "lots");
    let err = NetworkConfig::from_env().unwrap_err();
    assert!(err.to_string().contains("NETREF_MAX_CONNECTIONS"));

    clear_env();
    std::env::set_var("NETREF_ACCESS_MODE", "everything");
    let err = NetworkConfig::from_env().unwrap_err();
    assert!(err.to_string().contains("NETREF_ACCESS_MODE"));
    clear_env();
}

#[test]
fn test_transport_limit_caps_connection_payload() {
    let mut config = NetworkConfig::default();
    config.transport.max_payload_size = 64 * 1024;
    assert_eq!(config.connection_config().max_payload_size, 64 * 1024);

    config.connection.max_payload_size = 4 * 1024;
    assert_eq!(config.connection_config().max_payload_size, 4 * 1024);
    assert_eq!(config.connection_config().service_name, config.connection.service_name);
}
