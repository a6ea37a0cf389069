//! cde-protocol: Wire protocol for cde tunnel multiplexing
//!
//! This crate defines the frame format used between the client and server
//! endpoints. Every transport message carries one frame: a 2-byte header
//! (message kind, channel id) followed by an opaque payload whose length is
//! implied by the transport's own message boundary.

pub mod channel;
pub mod codec;
pub mod error;
pub mod frame;
pub mod message;

pub use channel::{ChannelId, Epoch, MAX_CHANNELS};
pub use codec::{FrameCodec, LENGTH_PREFIX_SIZE};
pub use error::ProtocolError;
pub use frame::{decode, encode, FrameHeader, HEADER_SIZE};
pub use message::{Message, MessageKind, Origin};
