//! Length-prefixed frames over a byte stream

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

use cde_protocol::FrameCodec;

use super::{FrameSink, FrameSource, Transport};
use crate::error::TransportError;

/// Transport over any byte stream, each frame prefixed with its length
pub struct StreamTransport<T> {
    framed: Framed<T, FrameCodec>,
}

impl<T> StreamTransport<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Wrap a connected stream
    pub fn new(io: T, max_frame_size: usize) -> Self {
        Self {
            framed: Framed::new(io, FrameCodec::with_max_frame_size(max_frame_size)),
        }
    }
}

/// Connect a TCP stream transport to `addr`
pub async fn connect_tcp(
    addr: &str,
    max_frame_size: usize,
) -> Result<StreamTransport<TcpStream>, TransportError> {
    let stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;
    tracing::debug!("TCP transport connected to {}", addr);
    Ok(StreamTransport::new(stream, max_frame_size))
}

/// Write half of a [`StreamTransport`]
pub struct StreamSink<T> {
    sink: SplitSink<Framed<T, FrameCodec>, Bytes>,
}

/// Read half of a [`StreamTransport`]
pub struct StreamSource<T> {
    stream: SplitStream<Framed<T, FrameCodec>>,
}

impl<T> Transport for StreamTransport<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    type Sink = StreamSink<T>;
    type Source = StreamSource<T>;

    fn split(self) -> (Self::Sink, Self::Source) {
        let (sink, stream) = self.framed.split();
        (StreamSink { sink }, StreamSource { stream })
    }
}

#[async_trait]
impl<T> FrameSink for StreamSink<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn send_frame(&mut self, frame: Bytes) -> Result<(), TransportError> {
        self.sink.send(frame).await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.sink.close().await?;
        Ok(())
    }
}

#[async_trait]
impl<T> FrameSource for StreamSource<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn next_frame(&mut self) -> Result<Option<Bytes>, TransportError> {
        match self.stream.next().await {
            Some(Ok(frame)) => Ok(Some(frame)),
            Some(Err(e)) => Err(e.into()),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_duplex_roundtrip() {
        // Smaller than one frame: the writer only finishes while the reader drains
        let (a, b) = tokio::io::duplex(64);
        let (mut a_sink, a_source) = StreamTransport::new(a, 1024).split();
        let (_b_sink, mut b_source) = StreamTransport::new(b, 1024).split();

        let write = async move {
            a_sink.send_frame(Bytes::from_static(b"\x02\x01payload")).await.unwrap();
            a_sink.send_frame(Bytes::from(vec![7u8; 300])).await.unwrap();
            drop(a_sink);
            drop(a_source);
        };
        let read = async {
            let first = b_source.next_frame().await.unwrap().unwrap();
            let second = b_source.next_frame().await.unwrap().unwrap();
            let end = b_source.next_frame().await.unwrap();
            (first, second, end)
        };

        let ((), (first, second, end)) =
            tokio::time::timeout(Duration::from_secs(5), async { tokio::join!(write, read) })
                .await
                .expect("stream transport stalled");

        assert_eq!(first, Bytes::from_static(b"\x02\x01payload"));
        assert_eq!(second.len(), 300);
        assert!(end.is_none());
    }
}
