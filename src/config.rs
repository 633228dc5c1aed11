//! Proxy configuration
//!
//! Settings come from an optional JSON file and are then overridden by
//! command-line flags (or their `PORTWAY_*` environment variables).

use anyhow::{bail, Context, Result};
use portway_server_tcp::{RelayConfig, TcpProxyServerConfig, DEFAULT_MAX_HEAD_BYTES};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;

/// Proxy configuration as stored on disk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// IPv4 address to listen on; `0.0.0.0` listens on all interfaces
    pub bind_address: String,
    pub port: u16,
    /// Type tag reported with every lifecycle event
    pub kind: String,
    pub connect_timeout_secs: u64,
    pub handshake_timeout_secs: u64,
    /// Grace period for open tunnels after stop
    pub drain_timeout_secs: u64,
    pub max_head_bytes: usize,
    pub backlog: i32,
    pub log_level: String,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1".to_string(),
            port: 3128,
            kind: "http-connect".to_string(),
            connect_timeout_secs: 10,
            handshake_timeout_secs: 10,
            drain_timeout_secs: 5,
            max_head_bytes: DEFAULT_MAX_HEAD_BYTES,
            backlog: 1024,
            log_level: "info".to_string(),
        }
    }
}

/// Values given on the command line, applied on top of the file
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub bind_address: Option<String>,
    pub port: Option<u16>,
    pub kind: Option<String>,
    pub connect_timeout_secs: Option<u64>,
    pub handshake_timeout_secs: Option<u64>,
    pub drain_timeout_secs: Option<u64>,
    pub log_level: Option<String>,
}

impl ProxyConfig {
    /// Load the configuration from a JSON file
    ///
    /// Missing fields take their default values.
    pub fn load(path: &Path) -> Result<Self> {
        let json = fs::read_to_string(path)
            .context(format!("Failed to read config file: {:?}", path))?;

        let config: ProxyConfig = serde_json::from_str(&json)
            .context(format!("Failed to parse config file: {:?}", path))?;

        Ok(config)
    }

    /// Load from `path` if given, otherwise start from the defaults
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    pub fn apply(&mut self, overrides: ConfigOverrides) {
        if let Some(bind_address) = overrides.bind_address {
            self.bind_address = bind_address;
        }
        if let Some(port) = overrides.port {
            self.port = port;
        }
        if let Some(kind) = overrides.kind {
            self.kind = kind;
        }
        if let Some(secs) = overrides.connect_timeout_secs {
            self.connect_timeout_secs = secs;
        }
        if let Some(secs) = overrides.handshake_timeout_secs {
            self.handshake_timeout_secs = secs;
        }
        if let Some(secs) = overrides.drain_timeout_secs {
            self.drain_timeout_secs = secs;
        }
        if let Some(log_level) = overrides.log_level {
            self.log_level = log_level;
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.bind_ip()?;

        if self.kind.trim().is_empty() {
            bail!("kind must not be empty");
        }
        if self.connect_timeout_secs == 0 {
            bail!("connect_timeout_secs must be greater than zero");
        }
        if self.handshake_timeout_secs == 0 {
            bail!("handshake_timeout_secs must be greater than zero");
        }
        if self.max_head_bytes < 64 {
            bail!(
                "max_head_bytes must be at least 64 bytes (got {})",
                self.max_head_bytes
            );
        }
        if self.backlog <= 0 {
            bail!("backlog must be positive (got {})", self.backlog);
        }

        Ok(())
    }

    pub fn bind_ip(&self) -> Result<Ipv4Addr> {
        self.bind_address
            .parse()
            .context(format!("Invalid bind address: {:?}", self.bind_address))
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }

    /// Build the server configuration; call [`ProxyConfig::validate`] first
    pub fn server_config(&self) -> Result<TcpProxyServerConfig> {
        let ip = self.bind_ip()?;
        let address = if ip.is_unspecified() { None } else { Some(ip) };

        Ok(TcpProxyServerConfig {
            address,
            port: self.port,
            kind: self.kind.clone(),
            backlog: self.backlog,
            handshake_timeout: Duration::from_secs(self.handshake_timeout_secs),
            max_head_bytes: self.max_head_bytes,
            relay: RelayConfig {
                connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            },
        })
    }
}
