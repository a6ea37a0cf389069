//! Client configuration

use serde::{Deserialize, Serialize};
use std::ops::RangeInclusive;
use std::time::Duration;

use super::mux::{MuxConfig, TransportKind};
use super::serde_utils::duration_secs;
use crate::error::ConfigError;

/// Configuration for the client endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Server to connect to: a `ws://` URL for the WebSocket transport,
    /// `host:port` for the TCP transport
    pub server_url: String,

    /// Transport carrying the tunnel
    pub transport: TransportKind,

    /// Remote ports to expose locally, one listener group each
    pub forwards: Vec<u16>,

    /// Address local listener groups bind to
    pub listen_host: String,

    /// Candidate range for local listener ports
    pub port_range: PortRange,

    /// How many candidate ports to try before giving up
    pub probe_attempts: u32,

    /// Handshake text sent in the INIT message
    pub init_payload: String,

    /// Timeout for establishing the transport connection
    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,

    /// Reconnect after the transport drops
    pub reconnect: bool,

    /// Backoff between reconnection attempts
    pub backoff: BackoffConfig,

    /// Multiplexer tuning
    pub mux: MuxConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:9000/serve".to_string(),
            transport: TransportKind::Websocket,
            forwards: vec![22],
            listen_host: "127.0.0.1".to_string(),
            port_range: PortRange::default(),
            probe_attempts: 64,
            init_payload: "init".to_string(),
            connect_timeout: Duration::from_secs(30),
            reconnect: true,
            backoff: BackoffConfig::default(),
            mux: MuxConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Check the settings before connecting
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.mux.validate()?;
        if self.port_range.start > self.port_range.end {
            return Err(ConfigError::Invalid(format!(
                "port_range start {} is above end {}",
                self.port_range.start, self.port_range.end
            )));
        }
        if self.probe_attempts == 0 {
            return Err(ConfigError::Invalid("probe_attempts must be positive".into()));
        }
        Ok(())
    }
}

/// Inclusive range of candidate local ports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    /// First candidate port
    pub start: u16,
    /// Last candidate port
    pub end: u16,
}

impl PortRange {
    /// Create a new range
    pub fn new(start: u16, end: u16) -> Self {
        Self { start, end }
    }

    /// As a std range
    pub fn to_range(self) -> RangeInclusive<u16> {
        self.start..=self.end
    }
}

impl Default for PortRange {
    fn default() -> Self {
        Self {
            start: 9000,
            end: 65535,
        }
    }
}

/// Exponential backoff configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Initial delay
    #[serde(with = "duration_secs")]
    pub initial: Duration,

    /// Maximum delay
    #[serde(with = "duration_secs")]
    pub max: Duration,

    /// Multiplier for each retry
    pub multiplier: f64,

    /// Jitter factor (0.0 to 1.0)
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: 0.25,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_forwards_ssh() {
        let config = ClientConfig::default();
        assert_eq!(config.forwards, vec![22]);
        assert_eq!(config.port_range.to_range(), 9000..=65535);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_inverted_range_rejected() {
        let config = ClientConfig {
            port_range: PortRange::new(10000, 9000),
            ..ClientConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }
}
