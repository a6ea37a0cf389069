//! Core error types for the cde tunnel

use std::ops::RangeInclusive;
use std::path::PathBuf;

use cde_protocol::{ChannelId, ProtocolError};
use thiserror::Error;

/// Errors raised by the message transport
#[derive(Error, Debug)]
pub enum TransportError {
    /// The transport is closed
    #[error("Transport closed")]
    Closed,

    /// Operation timed out
    #[error("Transport timed out: {0}")]
    Timeout(String),

    /// WebSocket failure
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Framing failure on a stream transport
    #[error("Framing error: {0}")]
    Protocol(#[from] ProtocolError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Channel allocation and lookup errors
#[derive(Error, Debug)]
pub enum ChannelError {
    /// Every channel id is in use
    #[error("Channel capacity exhausted: {capacity} channels live")]
    CapacityExhausted { capacity: usize },

    /// No local port could be bound within the probing bound
    #[error("No free local port after {attempts} attempts in {}..={}", range.start(), range.end())]
    NoFreePort {
        attempts: u32,
        range: RangeInclusive<u16>,
    },

    /// The peer named an id that is already live
    #[error("Channel already allocated: {0}")]
    AlreadyAllocated(ChannelId),

    /// The port group has no local listener
    #[error("No local listener for port {0}")]
    NotListening(u16),

    /// Binding a local listener failed
    #[error("Failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },
}

impl ChannelError {
    /// Whether the error reflects a resource limit rather than a fault
    pub fn is_capacity(&self) -> bool {
        matches!(self, Self::CapacityExhausted { .. } | Self::NoFreePort { .. })
    }
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialize error
    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}
