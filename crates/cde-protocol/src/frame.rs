//! Frame header encoding/decoding
//!
//! The frame format uses a 2-byte header:
//! - message kind: 1 byte (u8)
//! - channel id: 1 byte (u8, 0-254)
//!
//! The payload follows directly. Its length is not encoded: the transport
//! delivers one frame per message and the frame boundary ends the payload.
//! Stream transports without message boundaries wrap frames in
//! [`crate::codec::FrameCodec`].

use bytes::{BufMut, Bytes, BytesMut};

use crate::channel::ChannelId;
use crate::error::ProtocolError;
use crate::message::{Message, MessageKind, Origin};

/// Size of the frame header in bytes
pub const HEADER_SIZE: usize = 2;

/// Frame header carrying routing information
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Kind of message in the frame
    pub kind: MessageKind,
    /// Channel the frame belongs to
    pub channel: ChannelId,
}

impl FrameHeader {
    /// Create a new frame header
    pub fn new(kind: MessageKind, channel: ChannelId) -> Self {
        Self { kind, channel }
    }

    /// Encode the header into a byte buffer
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(HEADER_SIZE);
        dst.put_u8(self.kind.as_u8());
        dst.put_u8(self.channel.as_u8());
    }

    /// Decode a header from the start of a frame
    pub fn decode(src: &[u8]) -> Result<Self, ProtocolError> {
        if src.len() < HEADER_SIZE {
            return Err(ProtocolError::FrameTooShort { len: src.len() });
        }

        let kind = MessageKind::from_u8(src[0]).ok_or(ProtocolError::UnknownMessageKind(src[0]))?;
        let channel = ChannelId::new(src[1]).ok_or(ProtocolError::InvalidChannel(src[1]))?;

        Ok(Self { kind, channel })
    }
}

/// Encode a message into one transport frame
pub fn encode(message: &Message) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_SIZE + message.payload.len());
    FrameHeader::new(message.kind, message.channel).encode(&mut buf);
    buf.extend_from_slice(&message.payload);
    buf.freeze()
}

/// Decode one transport frame into a peer-originated message
pub fn decode(mut frame: Bytes) -> Result<Message, ProtocolError> {
    let header = FrameHeader::decode(&frame)?;
    let payload = frame.split_off(HEADER_SIZE);

    Ok(Message {
        kind: header.kind,
        channel: header.channel,
        origin: Origin::Peer,
        payload,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Epoch;

    fn peer(mut message: Message) -> Message {
        message.origin = Origin::Peer;
        message
    }

    #[test]
    fn test_header_roundtrip() {
        let header = FrameHeader::new(MessageKind::Forward, ChannelId::new(42).unwrap());

        let mut buf = BytesMut::with_capacity(HEADER_SIZE);
        header.encode(&mut buf);
        assert_eq!(&buf[..], &[2, 42]);

        let decoded = FrameHeader::decode(&buf).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn test_encode_layout() {
        let msg = Message::init("content");
        let frame = encode(&msg);
        assert_eq!(&frame[..], b"\x00\x00content");

        let close = Message::connection_close(ChannelId::new(3).unwrap(), Epoch(7), 22);
        assert_eq!(&encode(&close)[..], b"\x04\x0322");
    }

    #[test]
    fn test_message_roundtrip() {
        let id = ChannelId::new(254).unwrap();
        let messages = [
            Message::init(""),
            Message::init_ack("ready"),
            Message::forward(id, Epoch(1), Bytes::from(vec![0u8; 4096])),
            Message::forward(id, Epoch(1), Bytes::new()),
            Message::connection_create(id, Epoch(1), 65535),
            Message::connection_close(id, Epoch(1), 22),
            Message::error(id, Epoch(1), "connection refused"),
        ];

        for msg in messages {
            let msg = peer(msg);
            assert_eq!(decode(encode(&msg)).unwrap(), msg);
        }
    }

    #[test]
    fn test_decoded_messages_are_peer_originated() {
        let msg = Message::forward(ChannelId::new(1).unwrap(), Epoch(9), Bytes::from("x"));
        let decoded = decode(encode(&msg)).unwrap();
        assert_eq!(decoded.origin, Origin::Peer);
        assert!(decoded.is_from_peer());
    }

    #[test]
    fn test_short_frame() {
        assert!(matches!(
            decode(Bytes::new()),
            Err(ProtocolError::FrameTooShort { len: 0 })
        ));
        assert!(matches!(
            decode(Bytes::from_static(&[2])),
            Err(ProtocolError::FrameTooShort { len: 1 })
        ));
    }

    #[test]
    fn test_unknown_kind_and_reserved_channel() {
        assert!(matches!(
            decode(Bytes::from_static(&[0xFE, 0])),
            Err(ProtocolError::UnknownMessageKind(0xFE))
        ));
        assert!(matches!(
            decode(Bytes::from_static(&[2, 0xFF, 1, 2])),
            Err(ProtocolError::InvalidChannel(0xFF))
        ));
    }
}
