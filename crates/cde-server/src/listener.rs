//! Tunnel listener
//!
//! Accepts transport connections and serves each one as an independent
//! endpoint in its own task.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use cde_core::channel::DialOptions;
use cde_core::config::{ServerConfig, TransportKind};
use cde_core::demux::Demultiplexer;
use cde_core::port_group::ListenOptions;
use cde_core::transport::{accept_websocket, StreamTransport, Transport};
use cde_core::{Endpoint, TransportError};

use crate::router::ServerRouter;

/// Serve one tunnel connection until it ends or `shutdown` fires
///
/// Every channel and port group of the connection is released on return.
pub async fn serve_connection<T: Transport>(
    transport: T,
    config: &ServerConfig,
    shutdown: CancellationToken,
) -> Result<(), TransportError> {
    let (sink, source) = transport.split();
    let dial = DialOptions {
        host: config.dial_host.clone(),
        timeout: config.connect_timeout,
    };
    let (endpoint, bus) = Endpoint::new(&config.mux, ListenOptions::default(), dial);

    let router = tokio::spawn(ServerRouter::new(endpoint.clone(), sink, bus).run());
    let cancel = endpoint.cancel_token();

    let result = tokio::select! {
        result = Demultiplexer::new(source, endpoint.bus()).run() => result,
        _ = cancel.cancelled() => Ok(()),
        _ = shutdown.cancelled() => {
            tracing::debug!("Connection cancelled by server shutdown");
            Ok(())
        }
    };

    endpoint.shutdown();

    let routed = match router.await {
        Ok(routed) => routed,
        Err(e) => {
            tracing::error!("Router task failed: {}", e);
            Ok(())
        }
    };

    result.and(routed)
}

/// Accepts tunnel connections from clients
pub struct TunnelServer {
    config: Arc<ServerConfig>,
    cancel: CancellationToken,
    limit: Option<Arc<Semaphore>>,
}

impl TunnelServer {
    /// Create a server; it stops accepting when `cancel` fires
    pub fn new(config: ServerConfig, cancel: CancellationToken) -> Self {
        let limit = config
            .max_connections
            .map(|max| Arc::new(Semaphore::new(max as usize)));
        Self {
            config: Arc::new(config),
            cancel,
            limit,
        }
    }

    /// Bind the configured address and serve until cancelled
    pub async fn run(&self) -> Result<()> {
        let bind_addr = &self.config.bind_address;
        let listener = TcpListener::bind(bind_addr)
            .await
            .with_context(|| format!("Failed to bind to {}", bind_addr))?;
        self.serve(listener).await
    }

    /// Serve connections accepted on an already bound listener
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let local_addr = listener.local_addr()?;
        tracing::info!(
            "Tunnel server listening on {} ({})",
            local_addr,
            self.config.transport
        );

        loop {
            let permit = match &self.limit {
                Some(limit) => tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    permit = Arc::clone(limit).acquire_owned() => {
                        Some(permit.context("Connection limit closed")?)
                    }
                },
                None => None,
            };

            tokio::select! {
                // Check for shutdown
                _ = self.cancel.cancelled() => break,

                // Accept new connections
                result = listener.accept() => {
                    match result {
                        Ok((socket, peer_addr)) => self.handle_connection(socket, peer_addr, permit),
                        Err(e) => {
                            tracing::error!("Failed to accept connection: {}", e);
                        }
                    }
                }
            }
        }

        tracing::info!("Tunnel server shutting down");
        Ok(())
    }

    /// Handle a new incoming connection
    fn handle_connection(
        &self,
        socket: TcpStream,
        peer_addr: SocketAddr,
        permit: Option<OwnedSemaphorePermit>,
    ) {
        tracing::info!("New connection from {}", peer_addr);

        let config = Arc::clone(&self.config);
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            let _permit = permit;

            let result = match config.transport {
                TransportKind::Websocket => match accept_websocket(socket, &config.path).await {
                    Ok(transport) => serve_connection(transport, &config, cancel).await,
                    Err(e) => {
                        tracing::warn!("WebSocket handshake with {} failed: {}", peer_addr, e);
                        return;
                    }
                },
                TransportKind::Tcp => {
                    if let Err(e) = socket.set_nodelay(true) {
                        tracing::debug!("Failed to set TCP_NODELAY for {}: {}", peer_addr, e);
                    }
                    let transport = StreamTransport::new(socket, config.mux.max_frame_size);
                    serve_connection(transport, &config, cancel).await
                }
            };

            match result {
                Ok(()) => {
                    tracing::info!("Connection from {} closed normally", peer_addr);
                }
                Err(e) => {
                    tracing::warn!("Connection from {} closed with error: {}", peer_addr, e);
                }
            }
        });
    }
}
