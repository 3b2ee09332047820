//! Configuration management

use crate::tunnel::WorkMode;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Client configuration
    pub client: Option<ClientConfig>,
    /// Server configuration
    pub server: Option<ServerConfig>,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, crate::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config: {}", e)))?;

        toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), crate::Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::Error::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| crate::Error::Config(format!("Failed to write config: {}", e)))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            client: None,
            server: None,
            logging: LoggingConfig::default(),
        }
    }
}

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Address to accept user connections on
    pub listen: String,
    /// How local and remote addresses combine into tunnels
    #[serde(default)]
    pub mode: WorkMode,
    /// Local IP addresses to dial tunnels from
    pub local_addrs: Vec<String>,
    /// Remote tunnel endpoints (`host:port`)
    pub remote_addrs: Vec<String>,
    /// Tunnels per address pair in the multi modes
    #[serde(default = "default_fanout")]
    pub fanout: usize,
    /// Relaunch attempts per tunnel before giving up (unbounded if absent)
    #[serde(default)]
    pub max_retries: Option<u32>,
    /// Seconds between tunnel relaunch attempts
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8081".to_string(),
            mode: WorkMode::Biunique,
            local_addrs: vec!["127.0.0.1".to_string()],
            remote_addrs: vec!["127.0.0.1:8080".to_string()],
            fanout: default_fanout(),
            max_retries: None,
            retry_delay_secs: default_retry_delay(),
        }
    }
}

fn default_fanout() -> usize {
    2
}

fn default_retry_delay() -> u64 {
    5
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address to accept tunnel connections on
    pub listen: String,
    /// Upstream target dialed for every created connection
    pub upstream: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".to_string(),
            upstream: "127.0.0.1:80".to_string(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
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
        client: Some(ClientConfig::default()),
        server: Some(ServerConfig::default()),
        logging: LoggingConfig::default(),
    }
}
