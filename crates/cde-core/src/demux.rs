//! Inbound frame demultiplexer
//!
//! Reads frames from the transport, decodes them and publishes each message
//! on the endpoint bus, tagged as coming from the peer. The router picks
//! them up in the same order as locally produced traffic.

use tokio::sync::mpsc;

use cde_protocol::{decode, Message};

use crate::error::TransportError;
use crate::transport::FrameSource;

/// Drives the read half of a transport
pub struct Demultiplexer<R> {
    source: R,
    bus: mpsc::Sender<Message>,
}

impl<R: FrameSource> Demultiplexer<R> {
    /// Create a demultiplexer publishing onto `bus`
    pub fn new(source: R, bus: mpsc::Sender<Message>) -> Self {
        Self { source, bus }
    }

    /// Run until the transport ends
    ///
    /// Returns `Ok(())` when the peer closes the transport or the bus is
    /// gone, and the transport error otherwise. Frames that fail to decode
    /// are dropped and reading continues.
    pub async fn run(mut self) -> Result<(), TransportError> {
        let mut received: u64 = 0;

        loop {
            let frame = match self.source.next_frame().await? {
                Some(frame) => frame,
                None => {
                    tracing::info!("Transport closed by peer after {} frames", received);
                    return Ok(());
                }
            };

            if frame.is_empty() {
                tracing::trace!("Skipping empty frame");
                continue;
            }

            let message = match decode(frame) {
                Ok(message) => message,
                Err(e) => {
                    tracing::warn!("Dropping undecodable frame: {}", e);
                    continue;
                }
            };

            received += 1;
            tracing::trace!("Received {:?} for {}", message.kind, message.channel);

            if self.bus.send(message).await.is_err() {
                tracing::debug!("Bus closed, stopping demultiplexer");
                return Ok(());
            }
        }
    }
}
