//! In-process transport over tokio channels

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use super::{FrameSink, FrameSource, Transport};
use crate::error::TransportError;

/// One end of an in-memory transport pair
pub struct MemoryTransport {
    tx: mpsc::Sender<Bytes>,
    rx: mpsc::Receiver<Bytes>,
}

/// Create two connected in-memory transports
///
/// Frames sent on one end arrive, in order and with their boundaries, on
/// the other. Dropping or closing one end's sink ends the other's source.
pub fn pair(capacity: usize) -> (MemoryTransport, MemoryTransport) {
    let (a_tx, b_rx) = mpsc::channel(capacity);
    let (b_tx, a_rx) = mpsc::channel(capacity);
    (
        MemoryTransport { tx: a_tx, rx: a_rx },
        MemoryTransport { tx: b_tx, rx: b_rx },
    )
}

/// Write half of a [`MemoryTransport`]
pub struct MemorySink {
    tx: Option<mpsc::Sender<Bytes>>,
}

/// Read half of a [`MemoryTransport`]
pub struct MemorySource {
    rx: mpsc::Receiver<Bytes>,
}

impl Transport for MemoryTransport {
    type Sink = MemorySink;
    type Source = MemorySource;

    fn split(self) -> (Self::Sink, Self::Source) {
        (MemorySink { tx: Some(self.tx) }, MemorySource { rx: self.rx })
    }
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn send_frame(&mut self, frame: Bytes) -> Result<(), TransportError> {
        let tx = self.tx.as_ref().ok_or(TransportError::Closed)?;
        tx.send(frame).await.map_err(|_| TransportError::Closed)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.tx = None;
        Ok(())
    }
}

#[async_trait]
impl FrameSource for MemorySource {
    async fn next_frame(&mut self) -> Result<Option<Bytes>, TransportError> {
        Ok(self.rx.recv().await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pair_preserves_boundaries() {
        let (a, b) = pair(8);
        let (mut a_sink, _a_source) = a.split();
        let (_b_sink, mut b_source) = b.split();

        a_sink.send_frame(Bytes::from_static(b"one")).await.unwrap();
        a_sink.send_frame(Bytes::new()).await.unwrap();

        assert_eq!(b_source.next_frame().await.unwrap().unwrap(), "one");
        assert!(b_source.next_frame().await.unwrap().unwrap().is_empty());

        a_sink.close().await.unwrap();
        assert!(b_source.next_frame().await.unwrap().is_none());
        assert!(matches!(
            a_sink.send_frame(Bytes::new()).await,
            Err(TransportError::Closed)
        ));
    }
}
