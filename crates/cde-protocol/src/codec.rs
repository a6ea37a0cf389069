//! Tokio codec for carrying frames over byte streams
//!
//! The tunnel frame has no length field because message-oriented transports
//! (WebSocket) delimit frames themselves. When the transport is a plain byte
//! stream, each frame is prefixed with its length:
//! - frame_length: 4 bytes (u32, big-endian)
//! - frame: `frame_length` bytes (2-byte header + payload)

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::ProtocolError;

/// Size of the length prefix in bytes
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Default maximum frame size (16MB)
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Length-prefixed codec yielding raw frames
#[derive(Debug)]
pub struct FrameCodec {
    /// Largest frame accepted in either direction
    max_frame_size: usize,
    /// Length of the frame being decoded (if the prefix was already read)
    pending_length: Option<usize>,
}

impl FrameCodec {
    /// Create a new codec with the default size limit
    pub fn new() -> Self {
        Self::with_max_frame_size(DEFAULT_MAX_FRAME_SIZE)
    }

    /// Create a new codec with a custom size limit
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self {
            max_frame_size,
            pending_length: None,
        }
    }

    /// Largest frame this codec accepts
    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let length = match self.pending_length.take() {
            Some(len) => len,
            None => {
                if src.len() < LENGTH_PREFIX_SIZE {
                    return Ok(None);
                }
                src.get_u32() as usize
            }
        };

        if length > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                size: length,
                max: self.max_frame_size,
            });
        }

        if src.len() < length {
            // Save length and wait for more data
            self.pending_length = Some(length);
            src.reserve(length - src.len());
            return Ok(None);
        }

        Ok(Some(src.split_to(length).freeze()))
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, frame: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if frame.len() > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                size: frame.len(),
                max: self.max_frame_size,
            });
        }

        dst.reserve(LENGTH_PREFIX_SIZE + frame.len());
        dst.put_u32(frame.len() as u32);
        dst.extend_from_slice(&frame);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ChannelId, Epoch};
    use crate::frame::{decode, encode};
    use crate::message::{Message, Origin};

    #[test]
    fn test_codec_carries_tunnel_frames() {
        let mut codec = FrameCodec::new();
        let msg = Message::forward(ChannelId::new(7).unwrap(), Epoch(1), Bytes::from("hello"));

        let mut buf = BytesMut::new();
        codec.encode(encode(&msg), &mut buf).unwrap();
        assert_eq!(&buf[..LENGTH_PREFIX_SIZE], &[0, 0, 0, 7]);

        let frame = codec.decode(&mut buf).unwrap().unwrap();
        let decoded = decode(frame).unwrap();
        assert_eq!(decoded.origin, Origin::Peer);
        assert_eq!(decoded.payload.as_ref(), b"hello");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_codec_partial_read() {
        let mut codec = FrameCodec::new();

        let mut full_buf = BytesMut::new();
        codec
            .encode(Bytes::from_static(b"\x02\x01abcdef"), &mut full_buf)
            .unwrap();

        // Prefix only, then part of the frame
        let mut partial = full_buf.split_to(LENGTH_PREFIX_SIZE + 3);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        partial.extend_from_slice(&full_buf);
        let frame = codec.decode(&mut partial).unwrap().unwrap();
        assert_eq!(&frame[..], b"\x02\x01abcdef");
    }

    #[test]
    fn test_codec_back_to_back_frames() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(Bytes::from_static(b"\x00\x00"), &mut buf).unwrap();
        codec.encode(Bytes::from_static(b"\x02\x00xy"), &mut buf).unwrap();

        assert_eq!(&codec.decode(&mut buf).unwrap().unwrap()[..], b"\x00\x00");
        assert_eq!(&codec.decode(&mut buf).unwrap().unwrap()[..], b"\x02\x00xy");
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_codec_rejects_oversized_frames() {
        let mut codec = FrameCodec::with_max_frame_size(8);

        let mut buf = BytesMut::new();
        let err = codec.encode(Bytes::from(vec![0u8; 9]), &mut buf);
        assert!(matches!(err, Err(ProtocolError::FrameTooLarge { size: 9, max: 8 })));

        let mut buf = BytesMut::from(&[0u8, 0, 1, 0][..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtocolError::FrameTooLarge { size: 256, max: 8 })
        ));
    }
}
