//! Client-side endpoint router
//!
//! The client starts the handshake and owns the listener side of every
//! channel. Its accept loops allocate the channel ids and announce them to
//! the server, so the server never asks the client to create a channel.

use tokio::sync::mpsc;

use cde_core::transport::FrameSink;
use cde_core::{Endpoint, TransportError};
use cde_protocol::{Message, MessageKind, Origin};

/// Serialized dispatch loop for one client endpoint
pub struct ClientRouter<S> {
    endpoint: Endpoint,
    sink: S,
    bus: mpsc::Receiver<Message>,
}

impl<S: FrameSink> ClientRouter<S> {
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
        match message.origin {
            Origin::Local(_) => match message.kind {
                MessageKind::Init => {
                    tracing::debug!("Sending handshake");
                    Endpoint::send(&mut self.sink, &message).await
                }
                MessageKind::ConnectionCreate => {
                    tracing::info!("Connection created at {}, port {}", message.channel, message.text());
                    self.endpoint.send_local(&mut self.sink, &message).await
                }
                MessageKind::Forward | MessageKind::ConnectionClose | MessageKind::Error => {
                    self.endpoint.send_local(&mut self.sink, &message).await
                }
                MessageKind::InitAck => {
                    tracing::warn!("Dropping locally produced INIT_ACK");
                    Ok(())
                }
            },

            Origin::Peer => match message.kind {
                MessageKind::InitAck => {
                    tracing::info!("Server acknowledged handshake: {:?}", message.text());
                    Ok(())
                }
                MessageKind::Forward => self.endpoint.deliver_from_peer(&mut self.sink, message).await,
                MessageKind::ConnectionClose => {
                    self.endpoint.close_from_peer(&mut self.sink, &message).await
                }
                MessageKind::Error => {
                    tracing::error!("Server reported error on {}: {}", message.channel, message.text());
                    Ok(())
                }
                MessageKind::ConnectionCreate | MessageKind::Init => {
                    tracing::warn!(
                        "Protocol violation: server sent {:?} for {}",
                        message.kind,
                        message.channel
                    );
                    Ok(())
                }
            },
        }
    }
}
