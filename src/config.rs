//! Embedder-facing configuration.
//!
//! A plain deserializable struct so applications can load server settings
//! from their own TOML/JSON config files; nothing here touches the
//! filesystem.

use std::fmt;
use std::net::Ipv4Addr;

use serde::Deserialize;

use crate::addr::InetAddress;

/// Settings for one [`crate::TcpServer`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind to, `host:port`.
    pub listen: String,
    /// Number of worker loops; 0 serves I/O on the base loop.
    pub threads: usize,
    /// Set `SO_REUSEPORT` on the listen socket.
    pub reuse_port: bool,
    /// Log level suggestion for the embedding application (trace, debug,
    /// info, warn, error).
    pub log_level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            threads: 0,
            reuse_port: false,
            log_level: default_log_level(),
        }
    }
}

fn default_listen() -> String {
    "127.0.0.1:8002".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl ServerConfig {
    /// Parse and validate the `listen` field.
    pub fn listen_addr(&self) -> Result<InetAddress, ConfigError> {
        let (host, port_str) = self
            .listen
            .rsplit_once(':')
            .ok_or_else(|| ConfigError::InvalidAddress(self.listen.clone()))?;
        let port = port_str
            .parse()
            .map_err(|_| ConfigError::InvalidAddress(self.listen.clone()))?;
        let ip: Ipv4Addr = host
            .parse()
            .map_err(|_| ConfigError::InvalidAddress(self.listen.clone()))?;
        Ok(InetAddress::from(std::net::SocketAddrV4::new(ip, port)))
    }
}

/// Configuration errors.
#[derive(Debug)]
pub enum ConfigError {
    InvalidAddress(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::InvalidAddress(addr) => {
                write!(f, "invalid listen address '{addr}': expected ipv4:port")
            }
        }
    }
}

impl std::error::Error for ConfigError {}
