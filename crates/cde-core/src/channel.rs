//! Per-channel socket tasks
//!
//! Each established channel runs two tasks:
//! - a reader that turns local-socket bytes into FORWARD messages on the bus
//! - a writer that drains peer data queued by the router into the socket
//!
//! Sending the channel's CONNECTION_CLOSE, or releasing it, cancels both.
//! The writer first flushes whatever peer data was already queued, then the
//! socket closes when the tasks drop their halves. A failed write moves the
//! channel to `Closing` and announces the close like an EOF on the reader.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use cde_protocol::{ChannelId, Epoch, Message};

use crate::endpoint::Bus;
use crate::registry::{ChannelLease, ChannelRegistry};

/// Where forwarder channels connect
#[derive(Debug, Clone)]
pub struct DialOptions {
    /// Host to dial (the port comes from the channel's group)
    pub host: String,
    /// Give up on a dial after this long
    pub timeout: Duration,
}

impl Default for DialOptions {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            timeout: Duration::from_secs(10),
        }
    }
}

/// Shared handles for spawning channel tasks
#[derive(Debug, Clone)]
pub struct ChannelContext {
    /// Endpoint bus
    pub bus: Bus,
    /// Endpoint registry
    pub registry: Arc<ChannelRegistry>,
    /// Bytes per local-socket read
    pub chunk_size: usize,
}

/// Identity of one channel incarnation, carried by its tasks
#[derive(Debug, Clone, Copy)]
struct ChannelTag {
    id: ChannelId,
    epoch: Epoch,
    port: u16,
}

impl ChannelContext {
    /// Start relaying on a connected socket (listener side, or after a dial)
    pub fn spawn_established(&self, lease: ChannelLease, stream: TcpStream) {
        let tag = ChannelTag {
            id: lease.id,
            epoch: lease.epoch,
            port: lease.port,
        };
        self.relay(tag, lease.cancel, lease.to_socket, stream);
    }

    /// Dial `host:port` for a channel created by the peer, then relay
    ///
    /// Peer data that arrives while the dial is in flight stays queued and
    /// is written once the socket connects. A failed dial reports an ERROR
    /// for the channel and leaves it in `Allocated`.
    pub fn spawn_forwarder(&self, lease: ChannelLease, dial: &DialOptions) {
        let ctx = self.clone();
        let address = format!("{}:{}", dial.host, lease.port);
        let timeout = dial.timeout;

        tokio::spawn(async move {
            let tag = ChannelTag {
                id: lease.id,
                epoch: lease.epoch,
                port: lease.port,
            };
            tracing::info!("Dialing {} for {}", address, tag.id);

            let dialed = tokio::select! {
                _ = lease.cancel.cancelled() => {
                    tracing::debug!("{} released while dialing {}", tag.id, address);
                    return;
                }
                result = tokio::time::timeout(timeout, TcpStream::connect(&address)) => result,
            };

            let reason = match dialed {
                Ok(Ok(stream)) => {
                    if !ctx.registry.mark_established(tag.id, tag.epoch) {
                        tracing::debug!("{} no longer current after dial", tag.id);
                        return;
                    }
                    tracing::info!("{} established to {}", tag.id, address);
                    ctx.relay(tag, lease.cancel, lease.to_socket, stream);
                    return;
                }
                Ok(Err(e)) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
                    "connection refused".to_string()
                }
                Ok(Err(e)) => e.to_string(),
                Err(_) => format!("dial timed out after {:?}", timeout),
            };

            tracing::warn!("Failed to dial {} for {}: {}", address, tag.id, reason);
            let _ = ctx.bus.send(Message::error(tag.id, tag.epoch, reason)).await;
        });
    }

    fn relay(
        &self,
        tag: ChannelTag,
        cancel: CancellationToken,
        to_socket: mpsc::Receiver<Bytes>,
        stream: TcpStream,
    ) {
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!("Failed to set TCP_NODELAY on {}: {}", tag.id, e);
        }
        let (read_half, write_half) = stream.into_split();

        tokio::spawn(self.clone().read_loop(tag, cancel.clone(), read_half));
        tokio::spawn(self.clone().write_loop(tag, cancel, to_socket, write_half));
    }

    async fn read_loop(self, tag: ChannelTag, cancel: CancellationToken, mut socket: OwnedReadHalf) {
        let mut buffer = vec![0u8; self.chunk_size];

        loop {
            let read = tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                read = socket.read(&mut buffer) => read,
            };

            match read {
                Ok(0) => {
                    tracing::debug!("Local socket for {} reached EOF", tag.id);
                    break;
                }
                Ok(n) => {
                    let message =
                        Message::forward(tag.id, tag.epoch, Bytes::copy_from_slice(&buffer[..n]));
                    if self.bus.send(message).await.is_err() {
                        return;
                    }
                }
                Err(e) => {
                    tracing::warn!("Failed to read from local socket for {}: {}", tag.id, e);
                    break;
                }
            }
        }

        self.announce_close(tag).await;
    }

    async fn write_loop(
        self,
        tag: ChannelTag,
        cancel: CancellationToken,
        mut to_socket: mpsc::Receiver<Bytes>,
        mut socket: OwnedWriteHalf,
    ) {
        // Queued data is flushed before a release takes effect
        loop {
            let data = tokio::select! {
                biased;
                data = to_socket.recv() => data,
                _ = cancel.cancelled() => break,
            };

            let Some(data) = data else { break };
            if let Err(e) = socket.write_all(&data).await {
                tracing::warn!("Failed to write to local socket for {}: {}", tag.id, e);
                self.announce_close(tag).await;
                break;
            }
        }

        let _ = socket.shutdown().await;
    }

    /// Move the channel to `Closing` and tell the router, once per incarnation
    async fn announce_close(&self, tag: ChannelTag) {
        if self.registry.mark_closing(tag.id, tag.epoch) {
            let _ = self
                .bus
                .send(Message::connection_close(tag.id, tag.epoch, tag.port))
                .await;
        }
    }
}
