//! One client connection to the server
//!
//! A session owns a fresh endpoint for the lifetime of one transport
//! connection. Starting it queues the handshake and opens a listener group
//! per forwarded port; running it reads the transport until it ends.

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use cde_core::channel::DialOptions;
use cde_core::config::ClientConfig;
use cde_core::demux::Demultiplexer;
use cde_core::port_group::ListenOptions;
use cde_core::transport::{FrameSource, Transport};
use cde_core::{ChannelError, Endpoint, GroupKind, TransportError};
use cde_protocol::Message;

use crate::router::ClientRouter;

/// A remote port exposed on a local listener
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Forward {
    /// Port the server dials
    pub remote_port: u16,
    /// Local port accepting connections for it
    pub local_port: u16,
}

/// A connected client endpoint
pub struct Session<R> {
    endpoint: Endpoint,
    source: R,
    router: JoinHandle<Result<(), TransportError>>,
}

impl<R: FrameSource> Session<R> {
    /// Start the router, send INIT and open the configured forwards
    ///
    /// A forward whose local port cannot be bound is logged and skipped;
    /// the session still starts.
    pub async fn start<T>(transport: T, config: &ClientConfig) -> Result<Self, TransportError>
    where
        T: Transport<Source = R>,
    {
        let (sink, source) = transport.split();
        let listen = ListenOptions {
            host: config.listen_host.clone(),
            range: config.port_range.to_range(),
            attempts: config.probe_attempts,
        };
        let (endpoint, bus) = Endpoint::new(&config.mux, listen, DialOptions::default());

        let router = tokio::spawn(ClientRouter::new(endpoint.clone(), sink, bus).run());

        endpoint
            .bus()
            .send(Message::init(config.init_payload.clone()))
            .await
            .map_err(|_| TransportError::Closed)?;

        let session = Self {
            endpoint,
            source,
            router,
        };

        for &port in &config.forwards {
            if let Err(e) = session.open_forward(port) {
                tracing::error!("Cannot forward remote port {}: {}", port, e);
            }
        }

        Ok(session)
    }

    /// Expose a remote port on a local listener, returning the local port
    ///
    /// Opening the same remote port again returns the existing listener.
    pub fn open_forward(&self, remote_port: u16) -> Result<u16, ChannelError> {
        let group = self
            .endpoint
            .groups()
            .fetch_or_create_listener_group(remote_port)?;

        let local_port = group
            .local_port()
            .ok_or(ChannelError::NotListening(remote_port))?;
        tracing::info!("Forwarding local port {} -> remote port {}", local_port, remote_port);
        Ok(local_port)
    }

    /// Local port serving `remote_port`, if it is forwarded
    pub fn local_port(&self, remote_port: u16) -> Option<u16> {
        self.endpoint
            .groups()
            .group(GroupKind::Listener, remote_port)
            .and_then(|group| group.local_port())
    }

    /// All forwards, ordered by remote port
    pub fn forwards(&self) -> Vec<Forward> {
        let mut forwards: Vec<Forward> = self
            .endpoint
            .groups()
            .groups()
            .into_iter()
            .filter(|group| group.kind() == GroupKind::Listener)
            .filter_map(|group| {
                group.local_port().map(|local_port| Forward {
                    remote_port: group.port(),
                    local_port,
                })
            })
            .collect();
        forwards.sort_by_key(|forward| forward.remote_port);
        forwards
    }

    /// The session's endpoint
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Read the transport until it ends or `shutdown` fires
    ///
    /// All channels and listeners are released on return.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), TransportError> {
        let Self {
            endpoint,
            source,
            router,
        } = self;
        let cancel = endpoint.cancel_token();

        let result = tokio::select! {
            result = Demultiplexer::new(source, endpoint.bus()).run() => result,
            _ = cancel.cancelled() => Ok(()),
            _ = shutdown.cancelled() => {
                tracing::debug!("Session cancelled");
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
}

/// Start a session and run it to completion
pub async fn run_session<T: Transport>(
    transport: T,
    config: &ClientConfig,
    shutdown: CancellationToken,
) -> Result<(), TransportError> {
    Session::start(transport, config).await?.run(shutdown).await
}
