//! Settings shared by both endpoint roles

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Multiplexer tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MuxConfig {
    /// Bytes read from a local socket per FORWARD message
    pub read_chunk_size: usize,

    /// Depth of the endpoint bus between socket readers and the router
    pub bus_capacity: usize,

    /// Peer data chunks queued per channel; a channel whose local socket
    /// falls further behind is closed
    pub channel_queue_depth: usize,

    /// Largest frame accepted by the length-prefixed stream transport
    pub max_frame_size: usize,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            read_chunk_size: 1024,
            bus_capacity: 256,
            channel_queue_depth: crate::registry::DEFAULT_QUEUE_DEPTH,
            max_frame_size: cde_protocol::codec::DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

impl MuxConfig {
    /// Reject values that would stall the multiplexer
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.read_chunk_size == 0 {
            return Err(ConfigError::Invalid("read_chunk_size must be positive".into()));
        }
        if self.bus_capacity == 0 {
            return Err(ConfigError::Invalid("bus_capacity must be positive".into()));
        }
        if self.channel_queue_depth == 0 {
            return Err(ConfigError::Invalid("channel_queue_depth must be positive".into()));
        }
        if self.max_frame_size < cde_protocol::HEADER_SIZE + self.read_chunk_size {
            return Err(ConfigError::Invalid(format!(
                "max_frame_size {} cannot hold a {} byte chunk",
                self.max_frame_size, self.read_chunk_size
            )));
        }
        Ok(())
    }
}

/// Which transport carries the tunnel frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// One frame per WebSocket binary message
    #[default]
    Websocket,
    /// Length-prefixed frames over a raw TCP stream
    Tcp,
}

impl FromStr for TransportKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "websocket" | "ws" => Ok(Self::Websocket),
            "tcp" => Ok(Self::Tcp),
            other => Err(ConfigError::Invalid(format!("unknown transport: {}", other))),
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Websocket => write!(f, "websocket"),
            Self::Tcp => write!(f, "tcp"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = MuxConfig::default();
        assert_eq!(config.read_chunk_size, 1024);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_chunk_rejected() {
        let config = MuxConfig {
            read_chunk_size: 0,
            ..MuxConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_zero_queue_depth_rejected() {
        let config = MuxConfig {
            channel_queue_depth: 0,
            ..MuxConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_transport_kind_parse() {
        assert_eq!("ws".parse::<TransportKind>().unwrap(), TransportKind::Websocket);
        assert_eq!("TCP".parse::<TransportKind>().unwrap(), TransportKind::Tcp);
        assert!("quic".parse::<TransportKind>().is_err());
    }
}
