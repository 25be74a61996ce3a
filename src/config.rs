//! Service Configuration
//!
//! Loaded from an optional YAML file, then overridden from the command line.
//! The resulting value is handed to the service explicitly; nothing here is
//! global.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Default server group name
pub const DEFAULT_SERVER_GROUP: &str = "daos_server";

/// How revocation notices leave the service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "kind")]
pub enum NotifierConfig {
    /// Drop notices
    None,
    /// POST notices to `url`
    Webhook { url: String },
}

impl Default for NotifierConfig {
    fn default() -> Self {
        NotifierConfig::None
    }
}

/// Configuration of one pool service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Server groups this service can reach
    pub server_groups: Vec<String>,
    /// Deadline for one server-group round trip
    pub rpc_timeout_ms: u64,
    /// Deadline for the revocation fan-out of one eviction
    pub notify_timeout_ms: u64,
    /// Capacity of the pool event channel
    pub event_channel_capacity: usize,
    /// REST API bind address
    pub api_addr: String,
    /// Revocation transport
    pub notifier: NotifierConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            server_groups: vec![DEFAULT_SERVER_GROUP.to_string()],
            rpc_timeout_ms: 5_000,
            notify_timeout_ms: 2_000,
            event_channel_capacity: 1024,
            api_addr: "0.0.0.0:8090".to_string(),
            notifier: NotifierConfig::None,
        }
    }
}

impl ServiceConfig {
    /// Read a YAML file; missing keys keep their defaults
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.server_groups.is_empty() {
            return Err(Error::Configuration("no server groups configured".into()));
        }
        if self.rpc_timeout_ms == 0 || self.notify_timeout_ms == 0 {
            return Err(Error::Configuration("timeouts must be non-zero".into()));
        }
        if self.event_channel_capacity == 0 {
            return Err(Error::Configuration("event channel capacity must be non-zero".into()));
        }
        self.api_socket_addr()?;
        Ok(())
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn notify_timeout(&self) -> Duration {
        Duration::from_millis(self.notify_timeout_ms)
    }

    pub fn api_socket_addr(&self) -> Result<SocketAddr> {
        self.api_addr
            .parse()
            .map_err(|e| Error::Configuration(format!("invalid API address {:?}: {}", self.api_addr, e)))
    }
}
