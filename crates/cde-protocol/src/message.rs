//! Message types for the cde tunnel protocol
//!
//! A [`Message`] is the unit that travels on an endpoint's internal bus and,
//! once encoded, on the transport.
//!
//! # Message Flow
//!
//! 1. Client connects and sends `Init`; server answers with `InitAck`
//! 2. A local TCP connection is accepted on a client listener group; the
//!    client sends `ConnectionCreate { port }` for the freshly allocated channel
//! 3. Server dials `127.0.0.1:<port>` for that channel; on failure it sends
//!    `Error` tagged with the channel
//! 4. Stream bytes travel as `Forward` in both directions
//! 5. Either side sends `ConnectionClose { port }` when its local socket ends

use bytes::Bytes;

use crate::channel::{ChannelId, Epoch};
use crate::error::ProtocolError;

/// Message kind identifier, written as the first header byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    /// Handshake start (client -> server)
    Init = 0,
    /// Handshake acknowledgment (server -> client)
    InitAck = 1,
    /// Stream bytes for a channel
    Forward = 2,
    /// A channel was opened for the logical port in the payload
    ConnectionCreate = 3,
    /// A channel was closed
    ConnectionClose = 4,
    /// Human-readable error, optionally tagged with a channel
    Error = 5,
}

impl MessageKind {
    /// Convert to u8
    pub fn as_u8(&self) -> u8 {
        *self as u8
    }

    /// Convert from u8
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Init),
            1 => Some(Self::InitAck),
            2 => Some(Self::Forward),
            3 => Some(Self::ConnectionCreate),
            4 => Some(Self::ConnectionClose),
            5 => Some(Self::Error),
            _ => None,
        }
    }

    /// Whether the channel byte carries meaning for this kind
    pub fn is_channel_bound(&self) -> bool {
        !matches!(self, Self::Init | Self::InitAck)
    }
}

/// Which side produced a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Decoded from a transport frame written by the remote endpoint
    Peer,
    /// Produced on this endpoint by the channel incarnation with this epoch
    Local(Epoch),
}

/// One protocol message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Message kind
    pub kind: MessageKind,
    /// Channel the message refers to (ignored for Init/InitAck)
    pub channel: ChannelId,
    /// Producer of the message
    pub origin: Origin,
    /// Opaque payload
    pub payload: Bytes,
}

impl Message {
    /// Create a locally-originated message
    pub fn new(kind: MessageKind, channel: ChannelId, epoch: Epoch, payload: Bytes) -> Self {
        Self {
            kind,
            channel,
            origin: Origin::Local(epoch),
            payload,
        }
    }

    /// Handshake start
    pub fn init(text: impl Into<Bytes>) -> Self {
        Self::new(MessageKind::Init, ChannelId::CONTROL, Epoch::CONTROL, text.into())
    }

    /// Handshake acknowledgment
    pub fn init_ack(text: impl Into<Bytes>) -> Self {
        Self::new(MessageKind::InitAck, ChannelId::CONTROL, Epoch::CONTROL, text.into())
    }

    /// Stream bytes read from a local socket
    pub fn forward(channel: ChannelId, epoch: Epoch, data: Bytes) -> Self {
        Self::new(MessageKind::Forward, channel, epoch, data)
    }

    /// Announce a new channel bound to a logical port
    pub fn connection_create(channel: ChannelId, epoch: Epoch, port: u16) -> Self {
        Self::new(
            MessageKind::ConnectionCreate,
            channel,
            epoch,
            Bytes::from(port.to_string()),
        )
    }

    /// Announce that a channel is closed
    pub fn connection_close(channel: ChannelId, epoch: Epoch, port: u16) -> Self {
        Self::new(
            MessageKind::ConnectionClose,
            channel,
            epoch,
            Bytes::from(port.to_string()),
        )
    }

    /// Error report tagged with a channel
    pub fn error(channel: ChannelId, epoch: Epoch, text: impl Into<String>) -> Self {
        Self::new(
            MessageKind::Error,
            channel,
            epoch,
            Bytes::from(text.into()),
        )
    }

    /// Whether the remote endpoint produced this message
    pub fn is_from_peer(&self) -> bool {
        matches!(self.origin, Origin::Peer)
    }

    /// Payload as text, replacing invalid UTF-8
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }

    /// Parse the decimal port number carried by create/close payloads
    pub fn port(&self) -> Result<u16, ProtocolError> {
        let text = self.text();
        text.trim()
            .parse::<u16>()
            .map_err(|_| ProtocolError::InvalidPort(text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_kind_roundtrip() {
        for kind in [
            MessageKind::Init,
            MessageKind::InitAck,
            MessageKind::Forward,
            MessageKind::ConnectionCreate,
            MessageKind::ConnectionClose,
            MessageKind::Error,
        ] {
            let byte = kind.as_u8();
            assert_eq!(MessageKind::from_u8(byte), Some(kind));
        }
        assert_eq!(MessageKind::from_u8(6), None);
    }

    #[test]
    fn test_wire_values_are_stable() {
        assert_eq!(MessageKind::Init.as_u8(), 0);
        assert_eq!(MessageKind::InitAck.as_u8(), 1);
        assert_eq!(MessageKind::Forward.as_u8(), 2);
        assert_eq!(MessageKind::ConnectionCreate.as_u8(), 3);
        assert_eq!(MessageKind::ConnectionClose.as_u8(), 4);
        assert_eq!(MessageKind::Error.as_u8(), 5);
    }

    #[test]
    fn test_port_payload() {
        let id = ChannelId::new(0).unwrap();
        let msg = Message::connection_create(id, Epoch(1), 22);
        assert_eq!(msg.payload.as_ref(), b"22");
        assert_eq!(msg.port().unwrap(), 22);

        let bad = Message::error(id, Epoch(1), "not a port");
        assert!(matches!(bad.port(), Err(ProtocolError::InvalidPort(_))));
    }

    #[test]
    fn test_constructors_are_local() {
        let msg = Message::init("init");
        assert_eq!(msg.origin, Origin::Local(Epoch::CONTROL));
        assert!(!msg.is_from_peer());
        assert!(!msg.kind.is_channel_bound());
    }
}
