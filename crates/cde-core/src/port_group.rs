//! Port group management
//!
//! Channels are grouped by the logical port they serve and by role:
//!
//! - **Listener** groups own a local TCP listener on a freshly probed port.
//!   Every accepted connection becomes a new channel and is announced to the
//!   peer with CONNECTION_CREATE naming the logical port.
//! - **Forwarder** groups own no socket. Each member channel is created on
//!   the peer's request and dials the logical port itself.
//!
//! Group creation is fetch-or-create and happens under the map entry lock,
//! so one logical port never gets two groups of the same role.

use std::collections::BTreeSet;
use std::ops::RangeInclusive;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use cde_protocol::{ChannelId, Message};

use crate::channel::{ChannelContext, DialOptions};
use crate::error::ChannelError;
use crate::ports;
use crate::registry::{ChannelRegistry, ChannelState, ReleasedChannel};

/// Pause after a failed accept, so a persistent error does not spin
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Role of a port group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GroupKind {
    /// Accepts local TCP connections
    Listener,
    /// Dials local TCP connections on demand
    Forwarder,
}

/// Where listener groups bind
#[derive(Debug, Clone)]
pub struct ListenOptions {
    /// Local address to bind
    pub host: String,
    /// Candidate ports
    pub range: RangeInclusive<u16>,
    /// Candidates tried before giving up
    pub attempts: u32,
}

impl Default for ListenOptions {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            range: 9000..=65535,
            attempts: 64,
        }
    }
}

/// Channels sharing a logical port and a role
#[derive(Debug)]
pub struct PortGroup {
    kind: GroupKind,
    port: u16,
    local_port: Option<u16>,
    members: Mutex<BTreeSet<ChannelId>>,
}

impl PortGroup {
    fn new(kind: GroupKind, port: u16, local_port: Option<u16>) -> Self {
        Self {
            kind,
            port,
            local_port,
            members: Mutex::new(BTreeSet::new()),
        }
    }

    /// Role of the group
    pub fn kind(&self) -> GroupKind {
        self.kind
    }

    /// Logical port the group serves
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Local port the listener is bound to (listener groups only)
    pub fn local_port(&self) -> Option<u16> {
        self.local_port
    }

    /// Ids of the member channels
    pub fn channels(&self) -> Vec<ChannelId> {
        self.members
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .copied()
            .collect()
    }

    fn attach(&self, id: ChannelId) {
        self.members
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id);
    }

    fn detach(&self, id: ChannelId) {
        self.members
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
    }
}

/// Owns the port groups of one endpoint and the channel operations on them
#[derive(Debug)]
pub struct PortGroupManager {
    channels: ChannelContext,
    groups: DashMap<(GroupKind, u16), Arc<PortGroup>>,
    listen: ListenOptions,
    dial: DialOptions,
    cancel: CancellationToken,
}

impl PortGroupManager {
    /// Create a manager; accept loops stop when `cancel` fires
    pub fn new(
        channels: ChannelContext,
        listen: ListenOptions,
        dial: DialOptions,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            channels,
            groups: DashMap::new(),
            listen,
            dial,
            cancel,
        }
    }

    /// The channel registry
    pub fn registry(&self) -> &Arc<ChannelRegistry> {
        &self.channels.registry
    }

    /// Look up a group
    pub fn group(&self, kind: GroupKind, port: u16) -> Option<Arc<PortGroup>> {
        self.groups.get(&(kind, port)).map(|g| Arc::clone(&g))
    }

    /// All groups
    pub fn groups(&self) -> Vec<Arc<PortGroup>> {
        self.groups.iter().map(|g| Arc::clone(&g)).collect()
    }

    /// Return the forwarder group for `port`, creating it on first use
    pub fn fetch_or_create_forwarder_group(&self, port: u16) -> Arc<PortGroup> {
        self.groups
            .entry((GroupKind::Forwarder, port))
            .or_insert_with(|| {
                tracing::debug!("Created forwarder group for port {}", port);
                Arc::new(PortGroup::new(GroupKind::Forwarder, port, None))
            })
            .clone()
    }

    /// Return the listener group for `port`, binding a local port and
    /// starting its accept loop on first use
    pub fn fetch_or_create_listener_group(&self, port: u16) -> Result<Arc<PortGroup>, ChannelError> {
        match self.groups.entry((GroupKind::Listener, port)) {
            Entry::Occupied(entry) => Ok(Arc::clone(entry.get())),
            Entry::Vacant(entry) => {
                let (std_listener, local_port) =
                    ports::bind_in_range(&self.listen.host, self.listen.range.clone(), self.listen.attempts)?;
                let listener = TcpListener::from_std(std_listener).map_err(|source| ChannelError::Bind {
                    address: format!("{}:{}", self.listen.host, local_port),
                    source,
                })?;

                tracing::info!(
                    "Listening on local port {} for remote port {}",
                    local_port,
                    port
                );

                let group = Arc::new(PortGroup::new(GroupKind::Listener, port, Some(local_port)));
                entry.insert(Arc::clone(&group));

                tokio::spawn(accept_loop(
                    listener,
                    Arc::clone(&group),
                    self.channels.clone(),
                    self.cancel.child_token(),
                ));

                Ok(group)
            }
        }
    }

    /// Create a forwarder channel under the id the peer chose and start dialing
    pub fn open_forwarder(&self, id: ChannelId, port: u16) -> Result<(), ChannelError> {
        let lease = self
            .channels
            .registry
            .register(id, GroupKind::Forwarder, port)?;

        self.fetch_or_create_forwarder_group(port).attach(id);
        self.channels.spawn_forwarder(lease, &self.dial);
        Ok(())
    }

    /// Free a channel once the peer's CONNECTION_CLOSE for it arrived
    pub fn close_channel(&self, id: ChannelId) -> Option<ReleasedChannel> {
        let released = self.channels.registry.release(id)?;
        self.detach(&released);
        Some(released)
    }

    fn detach(&self, released: &ReleasedChannel) {
        if let Some(group) = self.group(released.kind, released.port) {
            group.detach(released.id);
        }
    }

    /// Stop all accept loops and release every channel and group
    pub fn shutdown(&self) -> usize {
        self.cancel.cancel();
        let released = self.channels.registry.clear();
        self.groups.clear();
        released
    }
}

async fn accept_loop(
    listener: TcpListener,
    group: Arc<PortGroup>,
    channels: ChannelContext,
    cancel: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        let (stream, peer_addr) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::error!("Failed to accept connection on port {}: {}", group.port, e);
                tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                continue;
            }
        };

        let lease = match channels
            .registry
            .allocate(GroupKind::Listener, group.port, ChannelState::Established)
        {
            Ok(lease) => lease,
            Err(e) => {
                tracing::warn!("Rejecting connection from {}: {}", peer_addr, e);
                continue;
            }
        };

        tracing::info!(
            "Accepted {} on port {} as {}",
            peer_addr,
            group.port,
            lease.id
        );
        group.attach(lease.id);

        // The peer must learn about the channel before its first FORWARD
        let created = Message::connection_create(lease.id, lease.epoch, group.port);
        if channels.bus.send(created).await.is_err() {
            break;
        }
        channels.spawn_established(lease, stream);
    }

    tracing::debug!("Accept loop for port {} stopped", group.port);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::Bus;
    use tokio::sync::mpsc;

    fn manager(capacity: usize) -> (PortGroupManager, mpsc::Receiver<Message>) {
        let (bus, bus_rx): (Bus, _) = mpsc::channel(16);
        let channels = ChannelContext {
            bus,
            registry: Arc::new(ChannelRegistry::with_capacity(capacity)),
            chunk_size: 1024,
        };
        let listen = ListenOptions {
            host: "127.0.0.1".to_string(),
            range: 20000..=60000,
            attempts: 64,
        };
        let manager = PortGroupManager::new(
            channels,
            listen,
            DialOptions::default(),
            CancellationToken::new(),
        );
        (manager, bus_rx)
    }

    #[tokio::test]
    async fn test_forwarder_group_is_idempotent() {
        let (manager, _bus) = manager(255);
        let a = manager.fetch_or_create_forwarder_group(22);
        let b = manager.fetch_or_create_forwarder_group(22);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.kind(), GroupKind::Forwarder);
        assert!(a.local_port().is_none());
        assert_eq!(manager.groups().len(), 1);
    }

    #[tokio::test]
    async fn test_listener_group_is_idempotent() {
        let (manager, _bus) = manager(255);
        let a = manager.fetch_or_create_listener_group(22).unwrap();
        let b = manager.fetch_or_create_listener_group(22).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(a.local_port().is_some());

        // Same logical port, other role: a separate group
        let f = manager.fetch_or_create_forwarder_group(22);
        assert!(!Arc::ptr_eq(&a, &f));
        assert_eq!(manager.groups().len(), 2);
        manager.shutdown();
    }

    #[tokio::test]
    async fn test_open_forwarder_tracks_membership() {
        let (manager, _bus) = manager(255);
        let id = ChannelId::new(5).unwrap();
        manager.open_forwarder(id, 1).unwrap();

        let group = manager.group(GroupKind::Forwarder, 1).unwrap();
        assert_eq!(group.channels(), vec![id]);
        assert!(matches!(
            manager.open_forwarder(id, 1),
            Err(ChannelError::AlreadyAllocated(_))
        ));

        let released = manager.close_channel(id).unwrap();
        assert_eq!(released.port, 1);
        assert!(group.channels().is_empty());
        assert!(manager.close_channel(id).is_none());
    }

    #[tokio::test]
    async fn test_accept_announces_channel() {
        let (manager, mut bus) = manager(255);
        let group = manager.fetch_or_create_listener_group(2222).unwrap();
        let local_port = group.local_port().unwrap();

        let _client = tokio::net::TcpStream::connect(("127.0.0.1", local_port))
            .await
            .unwrap();

        let created = tokio::time::timeout(Duration::from_secs(5), bus.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(created.kind, cde_protocol::MessageKind::ConnectionCreate);
        assert_eq!(created.channel, ChannelId::new(0).unwrap());
        assert_eq!(created.port().unwrap(), 2222);
        assert_eq!(manager.registry().state(created.channel), ChannelState::Established);
        assert_eq!(group.channels(), vec![created.channel]);
        manager.shutdown();
    }

    #[tokio::test]
    async fn test_accept_rejects_when_full() {
        let (manager, mut bus) = manager(1);
        let group = manager.fetch_or_create_listener_group(22).unwrap();
        let local_port = group.local_port().unwrap();

        let _first = tokio::net::TcpStream::connect(("127.0.0.1", local_port))
            .await
            .unwrap();
        let created = bus.recv().await.unwrap();
        assert_eq!(created.kind, cde_protocol::MessageKind::ConnectionCreate);

        // Second connection is accepted then dropped: the socket sees EOF
        let mut second = tokio::net::TcpStream::connect(("127.0.0.1", local_port))
            .await
            .unwrap();
        let mut buf = [0u8; 1];
        let read = tokio::time::timeout(
            Duration::from_secs(5),
            tokio::io::AsyncReadExt::read(&mut second, &mut buf),
        )
        .await
        .unwrap();
        assert!(matches!(read, Ok(0) | Err(_)));
        assert_eq!(manager.registry().len(), 1);
        manager.shutdown();
    }
}
