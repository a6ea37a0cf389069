//! Protocol error types

use thiserror::Error;

/// Errors that can occur during protocol operations
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Frame is shorter than the 2-byte header
    #[error("Frame too short: {len} bytes, header needs 2")]
    FrameTooShort { len: usize },

    /// Unknown message kind byte
    #[error("Unknown message kind: {0}")]
    UnknownMessageKind(u8),

    /// Channel id outside the usable range (255 is reserved)
    #[error("Invalid channel id: {0}")]
    InvalidChannel(u8),

    /// Frame exceeds the configured maximum size
    #[error("Frame too large: {size} bytes exceeds maximum of {max} bytes")]
    FrameTooLarge { size: usize, max: usize },

    /// Control payload does not hold a decimal port number
    #[error("Invalid port payload: {0:?}")]
    InvalidPort(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
