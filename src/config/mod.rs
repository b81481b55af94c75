//! Configuration management

use crate::proxy::{RouteTable, Target};
use crate::transport::TransportConfig;
use crate::tunnel::{Backoff, PeerId};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// HTTP front configuration
    #[serde(default)]
    pub server: ServerConfig,
    /// Tunnel listener and outbound peer
    #[serde(default)]
    pub tunnel: TunnelConfig,
    /// Ordered path routes; the first match wins
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, crate::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config: {}", e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), crate::Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::Error::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| crate::Error::Config(format!("Failed to write config: {}", e)))
    }

    /// Reject configurations the router cannot run with
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.server.identity.is_empty() {
            return Err(crate::Error::Config("server.identity must not be empty".into()));
        }
        if self.server.identity.len() > crate::protocol::MAX_IDENTITY_LEN {
            return Err(crate::Error::Config(format!(
                "server.identity is longer than {} bytes",
                crate::protocol::MAX_IDENTITY_LEN
            )));
        }
        if self.server.max_body_size == 0 {
            return Err(crate::Error::Config("server.max_body_size must be positive".into()));
        }
        if self.tunnel.exchange_timeout_ms == 0 {
            return Err(crate::Error::Config(
                "tunnel.exchange_timeout_ms must be positive".into(),
            ));
        }

        self.route_table()?;
        Ok(())
    }

    /// Compile the configured routes
    pub fn route_table(&self) -> Result<RouteTable, crate::Error> {
        RouteTable::from_config(&self.routes)
            .map_err(|e| crate::Error::Config(format!("Invalid route: {}", e)))
    }

    pub fn identity(&self) -> PeerId {
        PeerId::from(self.server.identity.as_str())
    }
}

/// HTTP front configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// HTTP listen address
    pub listen: String,
    /// Identity announced to tunnel peers
    pub identity: String,
    /// Largest request body accepted, in bytes
    pub max_body_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8080".to_string(),
            identity: "bifrost".to_string(),
            max_body_size: 8 * 1024 * 1024,
        }
    }
}

/// Tunnel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    /// Address accepting inbound tunnel links
    pub listen: Option<String>,
    /// Peer address to keep an outbound link to
    pub peer: Option<String>,
    /// How long a tunnelled request waits for its reply
    pub exchange_timeout_ms: u64,
    /// First reconnect delay
    pub reconnect_initial_ms: u64,
    /// Reconnect delay cap
    pub reconnect_max_ms: u64,
    /// Dial timeout for the outbound link
    pub connect_timeout_ms: u64,
    /// Inbound links accepted at once
    pub max_connections: usize,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            listen: None,
            peer: None,
            exchange_timeout_ms: 30_000,
            reconnect_initial_ms: 500,
            reconnect_max_ms: 30_000,
            connect_timeout_ms: 10_000,
            max_connections: 64,
        }
    }
}

impl TunnelConfig {
    pub fn exchange_timeout(&self) -> Duration {
        Duration::from_millis(self.exchange_timeout_ms)
    }

    pub fn backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_millis(self.reconnect_initial_ms),
            Duration::from_millis(self.reconnect_max_ms),
        )
    }

    pub fn transport(&self) -> TransportConfig {
        TransportConfig {
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            max_connections: self.max_connections,
            ..TransportConfig::default()
        }
    }
}

/// One path route
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteConfig {
    /// Regular expression matched against the request path
    pub path: String,
    /// `http://host[:port][/prefix]` or `peer://identity`
    pub target: String,
}

impl RouteConfig {
    pub fn new(path: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            target: target.into(),
        }
    }

    /// Whether this route sends requests through the tunnel
    pub fn is_peer(&self) -> bool {
        matches!(self.target.parse::<Target>(), Ok(Target::Peer(_)))
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (pretty, json, compact)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

/// Generate example configuration
pub fn generate_example_config() -> Config {
    Config {
        server: ServerConfig {
            identity: "edge".to_string(),
            ..ServerConfig::default()
        },
        tunnel: TunnelConfig {
            listen: Some("0.0.0.0:7070".to_string()),
            peer: Some("datacenter.internal:7070".to_string()),
            ..TunnelConfig::default()
        },
        routes: vec![
            RouteConfig::new("^/api/internal/", "peer://datacenter"),
            RouteConfig::new("^/api/", "http://127.0.0.1:9000"),
            RouteConfig::new("^/static/", "http://127.0.0.1:9001/assets"),
        ],
        logging: LoggingConfig::default(),
    }
}
