//! Server-side endpoint router
//!
//! The server answers the client's handshake and owns the forwarder side of
//! every channel: a CONNECTION_CREATE from the client opens a channel under
//! the client's id that dials the named port locally.

use tokio::sync::mpsc;

use cde_core::{Endpoint, TransportError};
use cde_core::transport::FrameSink;
use cde_protocol::{Epoch, Message, MessageKind, Origin};

/// Text carried by the INIT_ACK reply
pub const INIT_ACK_PAYLOAD: &str = "ready";

/// Serialized dispatch loop for one server endpoint
///
/// The router is the only writer to the transport sink.
pub struct ServerRouter<S> {
    endpoint: Endpoint,
    sink: S,
    bus: mpsc::Receiver<Message>,
}

impl<S: FrameSink> ServerRouter<S> {
    /// Create a router draining `bus` into `sink`
    pub fn new(endpoint: Endpoint, sink: S, bus: mpsc::Receiver<Message>) -> Self {
        Self {
            endpoint,
            sink,
            bus,
        }
    }

    /// Dispatch bus messages until the endpoint shuts down
    ///
    /// A failed transport write shuts the endpoint down and is returned.
    pub async fn run(mut self) -> Result<(), TransportError> {
        let cancel = self.endpoint.cancel_token();

        loop {
            let message = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                message = self.bus.recv() => match message {
                    Some(message) => message,
                    None => break,
                },
            };

            if let Err(e) = self.route(message).await {
                tracing::error!("Transport write failed: {}", e);
                self.endpoint.shutdown();
                return Err(e);
            }
        }

        if let Err(e) = self.sink.close().await {
            tracing::debug!("Failed to close transport: {}", e);
        }
        Ok(())
    }

    async fn route(&mut self, message: Message) -> Result<(), TransportError> {
        match (message.kind, message.origin) {
            (MessageKind::Init, Origin::Peer) => {
                tracing::info!("Client handshake: {:?}", message.text());
                Endpoint::send(&mut self.sink, &Message::init_ack(INIT_ACK_PAYLOAD)).await
            }

            (MessageKind::Forward, Origin::Peer) => {
                self.endpoint.deliver_from_peer(&mut self.sink, message).await
            }

            (MessageKind::ConnectionCreate, Origin::Peer) => self.open_channel(&message).await,

            (MessageKind::ConnectionClose, Origin::Peer) => {
                self.endpoint.close_from_peer(&mut self.sink, &message).await
            }

            (MessageKind::Error, Origin::Peer) => {
                tracing::warn!("Client reported error on {}: {}", message.channel, message.text());
                Ok(())
            }

            (MessageKind::Forward | MessageKind::ConnectionClose | MessageKind::Error, Origin::Local(_)) => {
                self.endpoint.send_local(&mut self.sink, &message).await
            }

            (kind, origin) => {
                tracing::warn!("Protocol violation: unexpected {:?} ({:?})", kind, origin);
                Ok(())
            }
        }
    }

    /// Create a forwarder channel for a peer CONNECTION_CREATE
    ///
    /// Failures are reported back to the client as an ERROR on the channel;
    /// they never end the connection.
    async fn open_channel(&mut self, message: &Message) -> Result<(), TransportError> {
        let id = message.channel;
        let opened = message
            .port()
            .map_err(|e| e.to_string())
            .and_then(|port| {
                self.endpoint
                    .groups()
                    .open_forwarder(id, port)
                    .map(|()| port)
                    .map_err(|e| e.to_string())
            });

        match opened {
            Ok(port) => {
                tracing::info!("Connection created at {}, port {}", id, port);
                Ok(())
            }
            Err(reason) => {
                tracing::warn!("Failed to open {}: {}", id, reason);
                Endpoint::send(&mut self.sink, &Message::error(id, Epoch::CONTROL, reason)).await
            }
        }
    }
}
