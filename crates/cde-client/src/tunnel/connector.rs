//! Outbound transport connector
//!
//! Opens the tunnel connection to the server over the configured transport.

use thiserror::Error;

use cde_core::config::{ClientConfig, TransportKind};
use cde_core::transport::{connect_tcp, connect_websocket, BoxedTransport};
use cde_core::TransportError;

use super::reconnect::ExponentialBackoff;

/// Connection errors
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// The server did not answer in time
    #[error("Connection to {address} timed out")]
    Timeout { address: String },

    /// The transport failed to connect
    #[error("Failed to connect to {address}: {source}")]
    Transport {
        address: String,
        #[source]
        source: TransportError,
    },
}

/// Connects the client to its server
pub struct TunnelConnector {
    config: ClientConfig,
}

impl TunnelConnector {
    /// Create a new connector
    pub fn new(config: ClientConfig) -> Self {
        Self { config }
    }

    /// The client configuration
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Connect, retrying with `backoff` until a connection succeeds
    pub async fn connect_with_retry(&self, backoff: &mut ExponentialBackoff) -> BoxedTransport {
        loop {
            match self.connect().await {
                Ok(transport) => {
                    backoff.reset();
                    return transport;
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    tracing::warn!("Connection failed: {}. Retrying in {:?}", e, delay);
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Attempt a single connection
    pub async fn connect(&self) -> Result<BoxedTransport, ConnectionError> {
        let address = self.config.server_url.clone();
        tracing::debug!("Connecting to {} over {}", address, self.config.transport);

        let attempt = async {
            match self.config.transport {
                TransportKind::Websocket => connect_websocket(&address).await.map(BoxedTransport::new),
                TransportKind::Tcp => connect_tcp(&address, self.config.mux.max_frame_size)
                    .await
                    .map(BoxedTransport::new),
            }
        };

        let transport = tokio::time::timeout(self.config.connect_timeout, attempt)
            .await
            .map_err(|_| ConnectionError::Timeout {
                address: address.clone(),
            })?
            .map_err(|source| ConnectionError::Transport {
                address: address.clone(),
                source,
            })?;

        tracing::info!("Connected to server at {}", address);
        Ok(transport)
    }
}
