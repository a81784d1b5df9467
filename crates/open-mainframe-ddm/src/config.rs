//! DRDA server configuration: listener, database identity, buffers, timeouts.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::buffer::DEFAULT_BUFFER_SIZE;
use crate::error::{DrdaError, DrdaResult};
use crate::response::ServerIdentity;

/// Configuration for the DRDA server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrdaServerConfig {
    /// Whether the DRDA server is enabled.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Bind host address.
    #[serde(default = "default_host")]
    pub host: String,
    /// Bind port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Database name to accept.
    #[serde(default = "default_database")]
    pub database: String,
    /// DDF location name.
    #[serde(default = "default_location")]
    pub location: String,
    /// Seconds to wait for the next request before running idle
    /// housekeeping; 0 waits forever.
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,
    /// Initial size of each connection's reply buffer.
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Extra buffering in front of the socket while streaming LOBs; 0 disables.
    #[serde(default)]
    pub stream_out_buffer_size: usize,
    /// Allow LD strings up to 65535 bytes instead of 32700.
    #[serde(default = "default_long_ld_strings")]
    pub long_ld_strings: bool,
    /// Dump every sent and received buffer at trace level.
    #[serde(default)]
    pub trace_buffers: bool,
    /// Attributes reported in EXCSATRD.
    #[serde(default)]
    pub identity: IdentityConfig,
}

/// Server attributes exchanged during EXCSAT.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityConfig {
    #[serde(default = "default_external_name")]
    pub external_name: String,
    /// Server name; the location name is used when empty.
    #[serde(default)]
    pub server_name: String,
    #[serde(default = "default_server_class")]
    pub server_class: String,
    #[serde(default = "default_release_level")]
    pub release_level: String,
}

impl DrdaServerConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &str) -> DrdaResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| DrdaError::Config(format!("{path}: {e}")))?;
        Self::from_toml(&content)
    }

    /// Parse configuration from TOML text.
    pub fn from_toml(content: &str) -> DrdaResult<Self> {
        toml::from_str(content).map_err(|e| DrdaError::Config(e.to_string()))
    }

    /// `host:port` to bind.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        (self.read_timeout_secs > 0).then(|| Duration::from_secs(self.read_timeout_secs))
    }

    pub fn server_identity(&self) -> ServerIdentity {
        let server_name = if self.identity.server_name.is_empty() {
            self.location.clone()
        } else {
            self.identity.server_name.clone()
        };
        ServerIdentity {
            external_name: self.identity.external_name.clone(),
            server_name,
            server_class: self.identity.server_class.clone(),
            release_level: self.identity.release_level.clone(),
        }
    }
}

impl Default for DrdaServerConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            host: default_host(),
            port: default_port(),
            database: default_database(),
            location: default_location(),
            read_timeout_secs: default_read_timeout(),
            buffer_size: default_buffer_size(),
            stream_out_buffer_size: 0,
            long_ld_strings: default_long_ld_strings(),
            trace_buffers: false,
            identity: IdentityConfig::default(),
        }
    }
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            external_name: default_external_name(),
            server_name: String::new(),
            server_class: default_server_class(),
            release_level: default_release_level(),
        }
    }
}

fn default_enabled() -> bool {
    true
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    50000
}

fn default_database() -> String {
    "DSN1".to_string()
}

fn default_location() -> String {
    "OPENMF".to_string()
}

fn default_read_timeout() -> u64 {
    60
}

fn default_buffer_size() -> usize {
    DEFAULT_BUFFER_SIZE
}

fn default_long_ld_strings() -> bool {
    true
}

fn default_external_name() -> String {
    ServerIdentity::default().external_name
}

fn default_server_class() -> String {
    ServerIdentity::default().server_class
}

fn default_release_level() -> String {
    ServerIdentity::default().release_level
}
