//! Configuration surface consumed by the core.
//!
//! Everything except the own onion address has a working default for the
//! typical deployment: a Tor client on loopback with its well-known SOCKS
//! port, and the TorChat protocol port for incoming connections.

use crate::error::{Error, Result};
use crate::identity::OnionAddress;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;

/// Well-known SOCKS port of a local Tor client.
pub const DEFAULT_SOCKS_PORT: u16 = 9050;

/// Protocol port peers listen on behind their onion service.
pub const DEFAULT_PROTOCOL_PORT: u16 = 11009;

/// User-id presented to the SOCKS proxy.
pub const DEFAULT_PROXY_USER: &str = "TorChat";

/// SOCKS4a proxy settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Proxy host, normally loopback.
    #[serde(default = "default_host")]
    pub host: String,
    /// Proxy port.
    #[serde(default = "default_socks_port")]
    pub port: u16,
    /// Arbitrary non-empty identifier sent in the SOCKS request.
    #[serde(default = "default_proxy_user")]
    pub user_id: String,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_socks_port(),
            user_id: default_proxy_user(),
        }
    }
}

impl ProxyConfig {
    /// Socket address of the proxy.
    ///
    /// The proxy itself is dialed directly (it is the one collaborator we
    /// are allowed to resolve locally).
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|e| Error::Config(format!("invalid proxy address: {e}")))
    }
}

/// Complete configuration for a client instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Our own onion service id. Mandatory.
    pub onion: OnionAddress,
    /// Address to accept incoming peer connections on.
    #[serde(default = "default_host")]
    pub listen_host: String,
    /// Port to accept incoming peer connections on.
    #[serde(default = "default_protocol_port")]
    pub listen_port: u16,
    /// SOCKS4a proxy used for all outgoing connections.
    #[serde(default)]
    pub proxy: ProxyConfig,
}

impl Config {
    /// Configuration with defaults for everything but the own address.
    pub fn new(onion: OnionAddress) -> Self {
        Self {
            onion,
            listen_host: default_host(),
            listen_port: default_protocol_port(),
            proxy: ProxyConfig::default(),
        }
    }

    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config: {e}")))?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the core cannot operate with.
    pub fn validate(&self) -> Result<()> {
        if self.proxy.user_id.is_empty() {
            return Err(Error::Config("proxy user id must not be empty".into()));
        }
        self.proxy.socket_addr()?;
        self.listen_addr()?;
        Ok(())
    }

    /// Socket address for the incoming listener.
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.listen_host, self.listen_port)
            .parse()
            .map_err(|e| Error::Config(format!("invalid listen address: {e}")))
    }
}

fn default_host() -> String {
    "127.0.0.1".to_owned()
}

fn default_socks_port() -> u16 {
    DEFAULT_SOCKS_PORT
}

fn default_protocol_port() -> u16 {
    DEFAULT_PROTOCOL_PORT
}

fn default_proxy_user() -> String {
    DEFAULT_PROXY_USER.to_owned()
}
