//! Endpoint state shared by the client and server routers
//!
//! An endpoint lives for one transport connection. It owns the bus that
//! socket readers, accept loops and the demultiplexer publish onto, the
//! port groups with their channel registry, and the cancellation token that
//! stops every task belonging to the connection.
//!
//! The router consuming the bus is the only writer to the transport. The
//! helpers here implement the routing steps both roles share; each role's
//! router decides which of them applies to a message.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use cde_protocol::{encode, Epoch, Message, MessageKind, Origin};

use crate::channel::{ChannelContext, DialOptions};
use crate::config::MuxConfig;
use crate::error::TransportError;
use crate::port_group::{ListenOptions, PortGroupManager};
use crate::registry::{ChannelRegistry, Delivery};
use crate::transport::FrameSink;

/// Sending side of the endpoint bus
pub type Bus = mpsc::Sender<Message>;

/// Handles for one running endpoint
#[derive(Debug, Clone)]
pub struct Endpoint {
    groups: Arc<PortGroupManager>,
    bus: Bus,
    cancel: CancellationToken,
}

impl Endpoint {
    /// Create an endpoint and the receiving side of its bus
    pub fn new(
        mux: &MuxConfig,
        listen: ListenOptions,
        dial: DialOptions,
    ) -> (Self, mpsc::Receiver<Message>) {
        let registry = ChannelRegistry::new().with_queue_depth(mux.channel_queue_depth);
        Self::with_registry(mux, listen, dial, registry)
    }

    /// Create an endpoint around a specific registry
    pub fn with_registry(
        mux: &MuxConfig,
        listen: ListenOptions,
        dial: DialOptions,
        registry: ChannelRegistry,
    ) -> (Self, mpsc::Receiver<Message>) {
        let (bus, bus_rx) = mpsc::channel(mux.bus_capacity);
        let cancel = CancellationToken::new();

        let channels = ChannelContext {
            bus: bus.clone(),
            registry: Arc::new(registry),
            chunk_size: mux.read_chunk_size,
        };
        let groups = Arc::new(PortGroupManager::new(
            channels,
            listen,
            dial,
            cancel.child_token(),
        ));

        (
            Self {
                groups,
                bus,
                cancel,
            },
            bus_rx,
        )
    }

    /// Port groups and channels
    pub fn groups(&self) -> &Arc<PortGroupManager> {
        &self.groups
    }

    /// Channel registry
    pub fn registry(&self) -> &Arc<ChannelRegistry> {
        self.groups.registry()
    }

    /// A new handle to the bus
    pub fn bus(&self) -> Bus {
        self.bus.clone()
    }

    /// Token cancelled when the endpoint shuts down
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Whether the endpoint has shut down
    pub fn is_shut_down(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Stop every task of this endpoint and release all channels
    pub fn shutdown(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.cancel.cancel();
        let released = self.groups.shutdown();
        tracing::info!("Endpoint shut down, released {} channels", released);
    }

    /// Encode a message and write it to the transport
    pub async fn send<S: FrameSink + ?Sized>(
        sink: &mut S,
        message: &Message,
    ) -> Result<(), TransportError> {
        sink.send_frame(encode(message)).await
    }

    /// Write peer FORWARD data to the channel's local socket
    ///
    /// A channel whose local socket cannot keep up is closed towards the
    /// peer rather than buffering without bound.
    pub async fn deliver_from_peer<S: FrameSink + ?Sized>(
        &self,
        sink: &mut S,
        message: Message,
    ) -> Result<(), TransportError> {
        let channel = message.channel;
        match self.registry().deliver(channel, message.payload) {
            Delivery::Queued => {}
            Delivery::Closing => {
                tracing::debug!("Dropping data for closing {}", channel);
            }
            Delivery::WriterGone => {
                tracing::warn!("Dropping data for {}: local socket is not connected", channel);
            }
            Delivery::Overflow { epoch, port } => {
                tracing::warn!("Local socket for {} is not keeping up, closing it", channel);
                let close = Message::connection_close(channel, epoch, port);
                self.send_close(sink, &close, epoch).await?;
            }
            Delivery::Unknown => {
                tracing::warn!("Protocol violation: data for unknown {}", channel);
            }
        }
        Ok(())
    }

    /// Handle a peer CONNECTION_CLOSE
    ///
    /// Answers our own close: the id is freed. Otherwise the peer closed
    /// first: the channel is freed and the close is returned once.
    pub async fn close_from_peer<S: FrameSink + ?Sized>(
        &self,
        sink: &mut S,
        message: &Message,
    ) -> Result<(), TransportError> {
        match self.groups.close_channel(message.channel) {
            Some(released) if released.close_sent => {
                tracing::debug!("Close of {} acknowledged, id is free", released.id);
                Ok(())
            }
            Some(released) => {
                tracing::info!(
                    "Connection closed at {}, port {}",
                    released.id,
                    released.port
                );
                let reply = Message::connection_close(released.id, released.epoch, released.port);
                Self::send(sink, &reply).await
            }
            None => {
                tracing::warn!(
                    "Protocol violation: close for unknown {} (port {})",
                    message.channel,
                    message.text()
                );
                Ok(())
            }
        }
    }

    /// Write locally produced channel traffic to the transport
    ///
    /// Traffic from an incarnation that no longer holds its id, or that has
    /// already sent its close, is dropped. Only the first close of an
    /// incarnation is sent; the id stays reserved until the peer answers it.
    pub async fn send_local<S: FrameSink + ?Sized>(
        &self,
        sink: &mut S,
        message: &Message,
    ) -> Result<(), TransportError> {
        let Origin::Local(epoch) = message.origin else {
            return Ok(());
        };

        if message.kind == MessageKind::ConnectionClose {
            return self.send_close(sink, message, epoch).await;
        }

        if !self.registry().can_send(message.channel, epoch) {
            tracing::debug!(
                "Dropping stale {:?} for {} ({})",
                message.kind,
                message.channel,
                epoch
            );
            return Ok(());
        }

        Self::send(sink, message).await
    }

    async fn send_close<S: FrameSink + ?Sized>(
        &self,
        sink: &mut S,
        close: &Message,
        epoch: Epoch,
    ) -> Result<(), TransportError> {
        if !self.registry().mark_close_sent(close.channel, epoch) {
            tracing::debug!("Dropping stale close for {} ({})", close.channel, epoch);
            return Ok(());
        }

        tracing::info!(
            "Local connection closed at {}, port {}",
            close.channel,
            close.text()
        );
        Self::send(sink, close).await
    }
}
