//! Server configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::mux::{MuxConfig, TransportKind};
use super::serde_utils::duration_secs;
use crate::error::ConfigError;

/// Configuration for the server endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the transport listener binds to
    pub bind_address: String,

    /// WebSocket upgrade path
    pub path: String,

    /// Transport carrying the tunnel
    pub transport: TransportKind,

    /// Host forwarder channels dial
    pub dial_host: String,

    /// Timeout for dialing a local service
    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,

    /// Maximum number of tunnel connections served at once
    pub max_connections: Option<u32>,

    /// Multiplexer tuning
    pub mux: MuxConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:9000".to_string(),
            path: "/serve".to_string(),
            transport: TransportKind::Websocket,
            dial_host: "127.0.0.1".to_string(),
            connect_timeout: Duration::from_secs(10),
            max_connections: None,
            mux: MuxConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Check the settings before binding
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.mux.validate()?;
        if !self.path.starts_with('/') {
            return Err(ConfigError::Invalid(format!(
                "path must start with '/': {}",
                self.path
            )));
        }
        if self.max_connections == Some(0) {
            return Err(ConfigError::Invalid("max_connections must be positive".into()));
        }
        Ok(())
    }
}
