//! # Configuration Management
//!
//! Centralized configuration for servers, clients and the connections they
//! carry.
//!
//! ## Configuration Sources
//! - TOML files via `from_file()` / `from_toml()`
//! - Environment variables (`NETREF_*`) via `from_env()`
//! - Direct instantiation with defaults and `default_with_overrides()`
//!
//! Durations are expressed in milliseconds in every serialized form.
//!
//! ## Security Considerations
//! - The default access mode is `public`: private names are never reachable
//! - Attribute writes, deletes and by-value snapshots are off by default
//! - Request timeouts bound how long a caller can be held by a silent peer

use crate::core::serialization::SerializationFormat;
use crate::error::{ProtocolError, Result};
use crate::protocol::policy::AccessMode;
use crate::utils::timeout;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::Duration;
use tracing::Level;

/// Current supported protocol version
pub const PROTOCOL_VERSION: u8 = 1;

/// Magic bytes identifying protocol frames ("NREF")
pub const MAGIC_BYTES: [u8; 4] = [0x4E, 0x52, 0x45, 0x46];

/// Max allowed payload size (16 MB)
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// Service name announced when none is configured
pub const DEFAULT_SERVICE_NAME: &str = "VoidService";

/// Main network configuration structure that contains all configurable settings
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct NetworkConfig {
    /// Server-specific configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Client-specific configuration
    #[serde(default)]
    pub client: ClientConfig,

    /// Per-connection protocol behaviour
    #[serde(default)]
    pub connection: ConnectionConfig,

    /// Transport configuration
    #[serde(default)]
    pub transport: TransportConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl NetworkConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(path)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to open config file: {e}")))?;

        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to read config file: {e}")))?;

        Self::from_toml(&contents)
    }

    /// Load configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to parse TOML: {e}")))
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("NETREF_SERVER_ADDRESS") {
            config.server.address = addr;
        }

        if let Ok(addr) = std::env::var("NETREF_CLIENT_ADDRESS") {
            config.client.address = addr;
        }

        if let Ok(limit) = std::env::var("NETREF_MAX_CONNECTIONS") {
            config.server.max_connections = parse_env("NETREF_MAX_CONNECTIONS", &limit)?;
        }

        if let Ok(timeout) = std::env::var("NETREF_CONNECTION_TIMEOUT_MS") {
            let val: u64 = parse_env("NETREF_CONNECTION_TIMEOUT_MS", &timeout)?;
            config.client.connection_timeout = Duration::from_millis(val);
        }

        if let Ok(timeout) = std::env::var("NETREF_REQUEST_TIMEOUT_MS") {
            let val: u64 = parse_env("NETREF_REQUEST_TIMEOUT_MS", &timeout)?;
            config.connection.sync_request_timeout = Duration::from_millis(val);
        }

        if let Ok(interval) = std::env::var("NETREF_KEEPALIVE_INTERVAL_MS") {
            let val: u64 = parse_env("NETREF_KEEPALIVE_INTERVAL_MS", &interval)?;
            config.connection.keepalive_interval = (val > 0).then(|| Duration::from_millis(val));
        }

        if let Ok(mode) = std::env::var("NETREF_ACCESS_MODE") {
            config.connection.access.mode = match mode.to_ascii_lowercase().as_str() {
                "unrestricted" => AccessMode::Unrestricted,
                "public" => AccessMode::Public,
                "restricted" => AccessMode::Restricted,
                other => {
                    return Err(ProtocolError::ConfigError(format!(
                        "Invalid NETREF_ACCESS_MODE: {other}"
                    )))
                }
            };
        }

        if let Ok(handling) = std::env::var("NETREF_REQUEST_HANDLING") {
            config.connection.request_handling = match handling.to_ascii_lowercase().as_str() {
                "inline" => RequestHandling::Inline,
                "concurrent" => RequestHandling::Concurrent,
                other => {
                    return Err(ProtocolError::ConfigError(format!(
                        "Invalid NETREF_REQUEST_HANDLING: {other}"
                    )))
                }
            };
        }

        if let Ok(level) = std::env::var("NETREF_LOG_LEVEL") {
            config.logging.log_level = level
                .parse::<Level>()
                .map_err(|_| ProtocolError::ConfigError(format!("Invalid NETREF_LOG_LEVEL: {level}")))?;
        }

        Ok(config)
    }

    /// Apply overrides to the default configuration
    pub fn default_with_overrides<F>(mutator: F) -> Self
    where
        F: FnOnce(&mut Self),
    {
        let mut config = Self::default();
        mutator(&mut config);
        config
    }

    /// Generate example configuration file content
    pub fn example_config() -> String {
        toml::to_string_pretty(&Self::default())
            .unwrap_or_else(|_| String::from("# Failed to generate example config"))
    }

    /// Save configuration to a file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path, content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to write config file: {e}")))?;

        Ok(())
    }

    /// Connection settings with the transport payload limit applied.
    /// The smaller of the two limits wins.
    pub fn connection_config(&self) -> ConnectionConfig {
        let mut connection = self.connection.clone();
        connection.max_payload_size = connection
            .max_payload_size
            .min(self.transport.max_payload_size);
        connection
    }

    /// Validate the configuration for common issues and misconfigurations
    ///
    /// Returns a list of validation errors. Empty list means configuration is valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        errors.extend(self.server.validate());
        errors.extend(self.client.validate());
        errors.extend(self.connection.validate());
        errors.extend(self.transport.validate());
        errors.extend(self.logging.validate());
        errors
    }

    /// Validate and return Result - convenience method
    pub fn validate_strict(&self) -> Result<()> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ProtocolError::ConfigError(format!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .parse::<T>()
        .map_err(|_| ProtocolError::ConfigError(format!("Invalid value for {name}: {value}")))
}

/// How an accepted connection is driven
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionPolicy {
    /// Connection tasks run on the shared runtime
    #[default]
    Shared,
    /// Each connection gets a dedicated OS thread with its own runtime
    Pinned,
}

/// Server-specific configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Server listen address (e.g., "127.0.0.1:18812")
    pub address: String,

    /// Maximum number of concurrent connections
    pub max_connections: usize,

    /// Timeout for graceful server shutdown
    #[serde(with = "duration_serde")]
    pub shutdown_timeout: Duration,

    /// Execution policy for accepted connections
    #[serde(default)]
    pub execution: ExecutionPolicy,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: String::from("127.0.0.1:18812"),
            max_connections: 1000,
            shutdown_timeout: timeout::SHUTDOWN_TIMEOUT,
            execution: ExecutionPolicy::Shared,
        }
    }
}

impl ServerConfig {
    /// Validate server configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.address.is_empty() {
            errors.push("Server address cannot be empty".to_string());
        } else if self.address.parse::<std::net::SocketAddr>().is_err() {
            errors.push(format!(
                "Invalid server address format: '{}' (expected format: '0.0.0.0:18812')",
                self.address
            ));
        }

        if self.shutdown_timeout.as_secs() < 1 {
            errors.push("Shutdown timeout too short (minimum: 1s)".to_string());
        } else if self.shutdown_timeout.as_secs() > 60 {
            errors.push("Shutdown timeout too long (maximum: 60s)".to_string());
        }

        if self.max_connections == 0 {
            errors.push("Max connections must be greater than 0".to_string());
        } else if self.max_connections > 100_000 {
            errors.push(format!(
                "Max connections very high: {} (ensure system resources can support this)",
                self.max_connections
            ));
        }

        errors
    }
}

/// Client-specific configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClientConfig {
    /// Target server address
    pub address: String,

    /// Timeout for connection attempts (transport connect plus handshake)
    #[serde(with = "duration_serde")]
    pub connection_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            address: String::from("127.0.0.1:18812"),
            connection_timeout: timeout::DEFAULT_TIMEOUT,
        }
    }
}

impl ClientConfig {
    /// Validate client configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.address.is_empty() {
            errors.push("Client address cannot be empty".to_string());
        } else if self.address.parse::<std::net::SocketAddr>().is_err() {
            errors.push(format!(
                "Invalid client address format: '{}' (expected format: '127.0.0.1:18812')",
                self.address
            ));
        }

        if self.connection_timeout.as_millis() < 100 {
            errors.push("Connection timeout too short (minimum: 100ms)".to_string());
        }

        errors
    }
}

/// How incoming requests are executed on the owning side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestHandling {
    /// One at a time, in arrival order
    #[default]
    Inline,
    /// Each request in its own task
    Concurrent,
}

/// Exposure policy settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AccessConfig {
    pub mode: AccessMode,
    pub allow_setattr: bool,
    pub allow_delattr: bool,
    /// Allow peers to obtain objects by value
    pub allow_snapshot: bool,
    /// Extra names reachable in restricted mode
    pub allowed_names: Vec<String>,
}

impl Default for AccessConfig {
    fn default() -> Self {
        Self {
            mode: AccessMode::Public,
            allow_setattr: false,
            allow_delattr: false,
            allow_snapshot: false,
            allowed_names: Vec::new(),
        }
    }
}

/// Per-connection protocol behaviour
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Bound on a synchronous request; the remote call may still complete
    #[serde(with = "duration_serde")]
    pub sync_request_timeout: Duration,

    /// Bound on the HELLO exchange
    #[serde(with = "duration_serde")]
    pub handshake_timeout: Duration,

    /// Interval between keepalive pings; `None` disables them
    #[serde(with = "opt_duration_serde")]
    pub keepalive_interval: Option<Duration>,

    pub request_handling: RequestHandling,

    /// Upper bound on requests running at once in concurrent mode
    pub max_concurrent_requests: usize,

    /// Message encoding; both sides must agree
    pub format: SerializationFormat,

    pub access: AccessConfig,

    /// Type names sent by value instead of by reference
    pub by_value_types: Vec<String>,

    /// Attach handler context to exceptions sent back to the caller
    pub include_local_traceback: bool,

    /// Name announced in HELLO
    pub service_name: String,

    /// Payload limit for the connection's frames
    pub max_payload_size: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            sync_request_timeout: timeout::DEFAULT_TIMEOUT,
            handshake_timeout: timeout::HANDSHAKE_TIMEOUT,
            keepalive_interval: None,
            request_handling: RequestHandling::Inline,
            max_concurrent_requests: 64,
            format: SerializationFormat::Bincode,
            access: AccessConfig::default(),
            by_value_types: Vec::new(),
            include_local_traceback: true,
            service_name: DEFAULT_SERVICE_NAME.to_string(),
            max_payload_size: MAX_PAYLOAD_SIZE,
        }
    }
}

impl ConnectionConfig {
    /// Validate connection configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.sync_request_timeout.as_millis() < 10 {
            errors.push("Request timeout too short (minimum: 10ms)".to_string());
        }

        if self.handshake_timeout.as_millis() < 100 {
            errors.push("Handshake timeout too short (minimum: 100ms)".to_string());
        }

        if let Some(interval) = self.keepalive_interval {
            if interval.as_millis() < 100 {
                errors.push("Keepalive interval too short (minimum: 100ms)".to_string());
            } else if interval.as_secs() > 3600 {
                errors.push("Keepalive interval too long (maximum: 1 hour)".to_string());
            }
        }

        if self.max_concurrent_requests == 0 {
            errors.push("Max concurrent requests must be greater than 0".to_string());
        }

        if self.service_name.is_empty() {
            errors.push("Service name cannot be empty".to_string());
        }

        if self.max_payload_size < 1024 {
            errors.push("Max payload size too small (minimum: 1 KB)".to_string());
        }

        if self.access.mode == AccessMode::Unrestricted && !self.access.allowed_names.is_empty() {
            errors.push(
                "WARNING: allowed_names has no effect in unrestricted access mode".to_string(),
            );
        }

        errors
    }
}

/// Transport configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TransportConfig {
    /// Maximum allowed payload size in bytes
    pub max_payload_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_payload_size: MAX_PAYLOAD_SIZE,
        }
    }
}

impl TransportConfig {
    /// Validate transport configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.max_payload_size == 0 {
            errors.push("Max payload size cannot be 0".to_string());
        } else if self.max_payload_size < 1024 {
            errors.push("Max payload size too small (minimum: 1 KB)".to_string());
        } else if self.max_payload_size > 100 * 1024 * 1024 {
            errors.push(format!(
                "Max payload size too large: {} bytes (maximum recommended: 100 MB)",
                self.max_payload_size
            ));
        }

        errors
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Application name for logs
    pub app_name: String,

    /// Log level
    #[serde(with = "log_level_serde")]
    pub log_level: Level,

    /// Whether to log to console
    pub log_to_console: bool,

    /// Whether to log to file
    pub log_to_file: bool,

    /// Path to log file (if log_to_file is true)
    pub log_file_path: Option<String>,

    /// Whether to use JSON formatting for logs
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("netref"),
            log_level: Level::INFO,
            log_to_console: true,
            log_to_file: false,
            log_file_path: None,
            json_format: false,
        }
    }
}

impl LoggingConfig {
    /// Validate logging configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.app_name.is_empty() {
            errors.push("Application name cannot be empty".to_string());
        } else if self.app_name.len() > 64 {
            errors.push(format!(
                "Application name too long: {} characters (maximum: 64)",
                self.app_name.len()
            ));
        }

        if self.log_to_file {
            if let Some(ref path) = self.log_file_path {
                if let Some(parent) = std::path::Path::new(path).parent() {
                    if !parent.as_os_str().is_empty() && !parent.exists() {
                        errors.push(format!(
                            "Log file directory does not exist: {}",
                            parent.display()
                        ));
                    }
                }
            } else {
                errors.push("log_file_path must be specified when log_to_file is true".to_string());
            }
        }

        if !self.log_to_console && !self.log_to_file {
            errors
                .push("At least one logging output (console or file) must be enabled".to_string());
        }

        errors
    }
}

/// Helper module for Duration serialization/deserialization
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = duration.as_millis() as u64;
        millis.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Optional duration in milliseconds; `0` means disabled, which keeps the
/// field expressible in TOML (no null)
mod opt_duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = duration.map(|d| d.as_millis() as u64).unwrap_or(0);
        millis.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok((millis > 0).then(|| Duration::from_millis(millis)))
    }
}

/// Helper module for tracing::Level serialization/deserialization
mod log_level_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::str::FromStr;
    use tracing::Level;

    pub fn serialize<S>(level: &Level, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let level_str = match *level {
            Level::TRACE => "trace",
            Level::DEBUG => "debug",
            Level::INFO => "info",
            Level::WARN => "warn",
            Level::ERROR => "error",
        };
        level_str.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Level, D::Error>
    where
        D: Deserializer<'de>,
    {
        let level_str = String::deserialize(deserializer)?;
        Level::from_str(&level_str)
            .map_err(|_| serde::de::Error::custom(format!("Invalid log level: {level_str}")))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(NetworkConfig::default().validate().is_empty());
    }

    #[test]
    fn test_toml_roundtrip_keeps_connection_section() {
        let config = NetworkConfig::default_with_overrides(|c| {
            c.connection.keepalive_interval = Some(Duration::from_secs(5));
            c.connection.request_handling = RequestHandling::Concurrent;
            c.connection.access.mode = AccessMode::Restricted;
            c.server.execution = ExecutionPolicy::Pinned;
        });
        let text = toml::to_string_pretty(&config).unwrap();
        let back = NetworkConfig::from_toml(&text).unwrap();
        assert_eq!(back.connection.keepalive_interval, Some(Duration::from_secs(5)));
        assert_eq!(back.connection.request_handling, RequestHandling::Concurrent);
        assert_eq!(back.connection.access.mode, AccessMode::Restricted);
        assert_eq!(back.server.execution, ExecutionPolicy::Pinned);
    }

    #[test]
    fn test_partial_connection_section_uses_defaults() {
        let config = NetworkConfig::from_toml(
            r#"
            [connection]
            sync_request_timeout = 2500
            keepalive_interval = 0

            [connection.access]
            mode = "unrestricted"
            "#,
        )
        .unwrap();
        assert_eq!(
            config.connection.sync_request_timeout,
            Duration::from_millis(2500)
        );
        assert_eq!(config.connection.keepalive_interval, None);
        assert_eq!(config.connection.access.mode, AccessMode::Unrestricted);
        assert!(!config.connection.access.allow_setattr);
        assert_eq!(config.connection.service_name, DEFAULT_SERVICE_NAME);
    }

    #[test]
    fn test_connection_validation() {
        let mut config = ConnectionConfig::default();
        config.max_concurrent_requests = 0;
        config.service_name.clear();
        let errors = config.validate();
        assert_eq!(errors.len(), 2);
    }
}
