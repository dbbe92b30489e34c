//! # Configuration Management
//!
//! This module handles loading the server and client settings from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP_ prefix)
//! - Default values (built into the code)
//!
//! ## Key Rust Concepts Used:
//! - **Serde**: `Serialize`/`Deserialize` derives let the `config` crate build these structs
//! - **impl Default**: the built-in values double as the lowest-priority source
//! - **Duration helpers**: raw millisecond fields stay serializable; callers get typed durations
//!
//! ## Configuration Priority (highest to lowest):
//! 1. `HOST` / `PORT` environment variables (deployment platforms)
//! 2. Environment variables (APP_SERVER__PORT, APP_PROTOCOL__RECEIVE_TIMEOUT_MS, etc.)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)

use crate::error::{SrError, SrResult};  // Our error type and Result alias
use serde::{Deserialize, Serialize};     // Derive macros for the config crate
use std::env;                            // HOST / PORT overrides
use std::time::Duration;

/// Main application configuration that contains all settings.
///
/// ## Why separate config structs:
/// The server, the wire protocol and the client are tuned independently;
/// a deployment that only runs the server never reads the `client` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub protocol: ProtocolConfig,
    pub client: ClientConfig,
}

/// Listening socket settings for the recognition server.
///
/// ## Fields:
/// - `host`: IP address or hostname to bind to (e.g., "127.0.0.1", "0.0.0.0")
/// - `port`: TCP port number to listen on
/// - `max_connections`: how many sessions may run at once; further accepts wait
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub max_connections: usize,
}

/// Timing and buffering parameters of the server side of the protocol.
///
/// ## Fields:
/// - `receive_timeout_ms`: per-receive deadline in the session loop (30s)
/// - `socket_idle_timeout_ms`: the socket is dropped after this long without any bytes (10s)
/// - `mailbox_lifetime_secs`: idle mailboxes are pruned after this long (30s)
/// - `header_buffer_bytes`: audio bytes buffered before the decoder is bound (600)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolConfig {
    pub receive_timeout_ms: u64,
    pub socket_idle_timeout_ms: u64,
    pub mailbox_lifetime_secs: u64,
    pub header_buffer_bytes: usize,
}

/// Settings used by `RemoteSpeechRecognizer` when it dials a server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    pub remote_host: String,
    pub remote_port: u16,
    /// Codec used to encode audio before upload ("pcm", "ulaw", "wav")
    pub codec: String,
    /// How long `finish` waits for the final result
    pub read_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    /// Idle mailbox lifetime on the client's transport
    pub mailbox_lifetime_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 62290,
                max_connections: 32,
            },
            protocol: ProtocolConfig::default(),
            client: ClientConfig::default(),
        }
    }
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            receive_timeout_ms: 30_000,
            socket_idle_timeout_ms: 10_000,
            mailbox_lifetime_secs: 30,
            header_buffer_bytes: 600,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            remote_host: "127.0.0.1".to_string(),
            remote_port: 62290,
            codec: "pcm".to_string(),
            read_timeout_ms: 3000,
            connect_timeout_ms: 5000,
            mailbox_lifetime_secs: 30,
        }
    }
}

impl ProtocolConfig {
    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms)
    }

    pub fn socket_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.socket_idle_timeout_ms)
    }

    pub fn mailbox_lifetime(&self) -> Duration {
        Duration::from_secs(self.mailbox_lifetime_secs)
    }
}

impl ClientConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn mailbox_lifetime(&self) -> Duration {
        Duration::from_secs(self.mailbox_lifetime_secs)
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Configuration Loading Process:
    /// 1. Start with built-in defaults
    /// 2. Override with values from config.toml (if it exists)
    /// 3. Override with environment variables prefixed with APP_
    /// 4. Handle special cases for HOST and PORT environment variables
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__HOST=0.0.0.0`: Override server host
    /// - `APP_PROTOCOL__HEADER_BUFFER_BYTES=1024`: Override the decoder threshold
    /// - `APP_CLIENT__CODEC=ulaw`: Override the upload codec
    /// - `PORT=3000`: Special case for deployment platforms
    ///
    /// ## Rust Concepts:
    /// - **Builder pattern**: Chain method calls to configure the config loader
    /// - **?**: Early return on error; `ConfigError` converts into `SrError::Config`
    /// - **if let Ok(...)**: Only override when the environment variable exists
    pub fn load() -> SrResult<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            // required(false) means "don't error if missing"
            .add_source(config::File::with_name("config").required(false))
            // Double underscore separates sections so field names may keep theirs
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// ## What this checks:
    /// - Ports are not 0
    /// - At least one connection may run
    /// - No timeout is zero (a zero receive timeout would end every session at once)
    /// - A client codec is named
    pub fn validate(&self) -> SrResult<()> {
        if self.server.port == 0 {
            return Err(SrError::Config("Server port cannot be 0".to_string()));
        }

        if self.server.max_connections == 0 {
            return Err(SrError::Config(
                "Max connections must be greater than 0".to_string(),
            ));
        }

        if self.protocol.receive_timeout_ms == 0 || self.protocol.socket_idle_timeout_ms == 0 {
            return Err(SrError::Config(
                "Protocol timeouts must be greater than 0".to_string(),
            ));
        }

        if self.protocol.mailbox_lifetime_secs == 0 {
            return Err(SrError::Config(
                "Mailbox lifetime must be greater than 0".to_string(),
            ));
        }

        if self.client.remote_port == 0 {
            return Err(SrError::Config("Client remote port cannot be 0".to_string()));
        }

        if self.client.read_timeout_ms == 0 || self.client.connect_timeout_ms == 0 {
            return Err(SrError::Config(
                "Client timeouts must be greater than 0".to_string(),
            ));
        }

        if self.client.codec.trim().is_empty() {
            return Err(SrError::Config("Client codec must be named".to_string()));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.protocol.receive_timeout(), Duration::from_secs(30));
        assert_eq!(config.protocol.socket_idle_timeout(), Duration::from_secs(10));
        assert_eq!(config.protocol.header_buffer_bytes, 600);
        assert_eq!(config.client.read_timeout(), Duration::from_millis(3000));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.protocol.receive_timeout_ms = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.client.codec = "  ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_round_trips_through_config_crate() {
        let source = config::Config::try_from(&AppConfig::default()).unwrap();
        let loaded: AppConfig = config::Config::builder()
            .add_source(source)
            .set_override("protocol.header_buffer_bytes", 1024)
            .unwrap()
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();
        assert_eq!(loaded.protocol.header_buffer_bytes, 1024);
        assert_eq!(loaded.client.codec, "pcm");
    }
}
