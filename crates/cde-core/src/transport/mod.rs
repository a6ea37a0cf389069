//! Message transport abstraction
//!
//! The multiplexer only needs a duplex channel that moves discrete frames:
//! "send one frame" on the write half and "receive the next frame" on the
//! read half. The router owns the write half so frames are never
//! interleaved; the demultiplexer owns the read half.

mod memory;
mod stream;
mod websocket;

pub use memory::{pair, MemorySink, MemorySource, MemoryTransport};
pub use stream::{connect_tcp, StreamSink, StreamSource, StreamTransport};
pub use websocket::{accept_websocket, connect_websocket, WsSink, WsSource, WsTransport};

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::TransportError;

/// Write half of a transport
#[async_trait]
pub trait FrameSink: Send {
    /// Send one frame as one transport message
    async fn send_frame(&mut self, frame: Bytes) -> Result<(), TransportError>;

    /// Close the write half gracefully
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Read half of a transport
#[async_trait]
pub trait FrameSource: Send {
    /// Receive the next frame
    ///
    /// Returns `Ok(None)` once the peer has closed the transport.
    async fn next_frame(&mut self) -> Result<Option<Bytes>, TransportError>;
}

/// A duplex frame transport that can be split into its halves
pub trait Transport: Send {
    /// Write half
    type Sink: FrameSink + 'static;
    /// Read half
    type Source: FrameSource + 'static;

    /// Split into write and read halves
    fn split(self) -> (Self::Sink, Self::Source);
}

#[async_trait]
impl FrameSink for Box<dyn FrameSink> {
    async fn send_frame(&mut self, frame: Bytes) -> Result<(), TransportError> {
        (**self).send_frame(frame).await
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        (**self).close().await
    }
}

#[async_trait]
impl FrameSource for Box<dyn FrameSource> {
    async fn next_frame(&mut self) -> Result<Option<Bytes>, TransportError> {
        (**self).next_frame().await
    }
}

/// Type-erased transport, for picking the implementation at runtime
pub struct BoxedTransport {
    sink: Box<dyn FrameSink>,
    source: Box<dyn FrameSource>,
}

impl BoxedTransport {
    /// Erase a concrete transport
    pub fn new<T: Transport>(transport: T) -> Self {
        let (sink, source) = transport.split();
        Self {
            sink: Box::new(sink),
            source: Box::new(source),
        }
    }
}

impl Transport for BoxedTransport {
    type Sink = Box<dyn FrameSink>;
    type Source = Box<dyn FrameSource>;

    fn split(self) -> (Self::Sink, Self::Source) {
        (self.sink, self.source)
    }
}
