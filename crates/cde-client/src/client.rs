//! Connection loop with reconnection

use std::time::Duration;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

use cde_core::config::ClientConfig;

use crate::session::run_session;
use crate::tunnel::{ExponentialBackoff, TunnelConnector};

/// Pause after a session ends before connecting again
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Keeps the client connected to its server
pub struct TunnelClient {
    connector: TunnelConnector,
}

impl TunnelClient {
    /// Create a client for `config`
    pub fn new(config: ClientConfig) -> Self {
        Self {
            connector: TunnelConnector::new(config),
        }
    }

    /// Connect and serve sessions until `cancel` fires
    ///
    /// With reconnection disabled the client serves one session and
    /// returns; a failed first connection is then an error.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let config = self.connector.config();
        // Reset after every successful connection
        let mut backoff = ExponentialBackoff::from_config(&config.backoff);

        loop {
            let transport = if config.reconnect {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    transport = self.connector.connect_with_retry(&mut backoff) => transport,
                }
            } else {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    transport = self.connector.connect() => {
                        transport.context("Failed to connect to server")?
                    }
                }
            };

            match run_session(transport, config, cancel.clone()).await {
                Ok(()) => tracing::info!("Disconnected from server"),
                Err(e) => tracing::warn!("Disconnected: {}", e),
            }

            if cancel.is_cancelled() || !config.reconnect {
                break;
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(RECONNECT_DELAY) => {}
            }
            tracing::info!("Reconnecting...");
        }

        Ok(())
    }
}
