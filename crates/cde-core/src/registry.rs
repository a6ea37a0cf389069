//! Channel registry
//!
//! The registry is the single owner of channel id allocation for one
//! endpoint. Every allocation, registration and release goes through one
//! mutex, so concurrent accept loops and the router can never hand out the
//! same id twice.
//!
//! A channel moves through `Allocated -> Established -> Closing` while it is
//! in the table; releasing it removes the entry, which is the `Closed` state.
//!
//! Closing is a handshake. The side that sends CONNECTION_CLOSE first keeps
//! the slot in `Closing` until the peer's CONNECTION_CLOSE for the id comes
//! back, so the id is not reused while frames of the old stream may still
//! be in flight.

use std::sync::{Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;

use cde_protocol::{ChannelId, Epoch, MAX_CHANNELS};

use crate::error::ChannelError;
use crate::port_group::GroupKind;

/// Peer data chunks buffered per channel before the channel is closed
pub const DEFAULT_QUEUE_DEPTH: usize = 256;

/// Lifecycle state of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Id reserved, local socket not yet connected
    Allocated,
    /// Local socket connected, bytes are relayed
    Established,
    /// Close under way; the id stays reserved until the peer's close arrives
    Closing,
    /// Id released
    Closed,
}

impl ChannelState {
    /// Whether peer data may still be queued for the local socket
    pub fn accepts_data(&self) -> bool {
        matches!(self, Self::Allocated | Self::Established)
    }
}

/// Everything a channel's socket tasks need, handed out on allocation
#[derive(Debug)]
pub struct ChannelLease {
    /// Allocated id
    pub id: ChannelId,
    /// Incarnation of the id
    pub epoch: Epoch,
    /// Logical port of the channel's group
    pub port: u16,
    /// Role of the channel's group
    pub kind: GroupKind,
    /// Cancelled when the channel is released
    pub cancel: CancellationToken,
    /// Peer data to write to the local socket
    pub to_socket: mpsc::Receiver<Bytes>,
}

/// Summary of a channel removed from the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReleasedChannel {
    /// Freed id
    pub id: ChannelId,
    /// Incarnation that held the id
    pub epoch: Epoch,
    /// Logical port of the channel's group
    pub port: u16,
    /// Role of the channel's group
    pub kind: GroupKind,
    /// State at the moment of release
    pub state: ChannelState,
    /// Whether this side had already sent its CONNECTION_CLOSE
    pub close_sent: bool,
}

/// Result of routing peer data to a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Queued for the channel's socket writer
    Queued,
    /// Channel is closing and no longer takes data
    Closing,
    /// The socket writer has already exited (for example after a failed dial)
    WriterGone,
    /// The queue is full; the channel was moved to `Closing` and must be
    /// closed towards the peer
    Overflow { epoch: Epoch, port: u16 },
    /// No live channel holds the id
    Unknown,
}

#[derive(Debug)]
struct Slot {
    epoch: Epoch,
    port: u16,
    kind: GroupKind,
    state: ChannelState,
    close_sent: bool,
    to_socket: mpsc::Sender<Bytes>,
    cancel: CancellationToken,
}

#[derive(Debug)]
struct Table {
    slots: Vec<Option<Slot>>,
    live: usize,
    next_epoch: u64,
}

/// Fixed-capacity table of live channels
#[derive(Debug)]
pub struct ChannelRegistry {
    table: Mutex<Table>,
    capacity: usize,
    queue_depth: usize,
}

impl ChannelRegistry {
    /// Create a registry with the full wire capacity (255 channels)
    pub fn new() -> Self {
        Self::with_capacity(MAX_CHANNELS)
    }

    /// Create a registry holding at most `capacity` channels
    ///
    /// The capacity is clamped to the wire limit.
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.min(MAX_CHANNELS);
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);

        Self {
            table: Mutex::new(Table {
                slots,
                live: 0,
                next_epoch: 1,
            }),
            capacity,
            queue_depth: DEFAULT_QUEUE_DEPTH,
        }
    }

    /// Set how many peer data chunks each channel buffers
    pub fn with_queue_depth(mut self, depth: usize) -> Self {
        self.queue_depth = depth.max(1);
        self
    }

    fn lock(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Maximum number of live channels
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of live channels, closing ones included
    pub fn len(&self) -> usize {
        self.lock().live
    }

    /// Check if no channel is live
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reserve the lowest free id
    ///
    /// The scan and the insert happen under one lock acquisition.
    pub fn allocate(
        &self,
        kind: GroupKind,
        port: u16,
        state: ChannelState,
    ) -> Result<ChannelLease, ChannelError> {
        let mut table = self.lock();

        let index = table
            .slots
            .iter()
            .position(Option::is_none)
            .ok_or(ChannelError::CapacityExhausted {
                capacity: self.capacity,
            })?;
        let id = ChannelId::from_index(index).ok_or(ChannelError::CapacityExhausted {
            capacity: self.capacity,
        })?;

        Ok(self.occupy(&mut table, id, kind, port, state))
    }

    /// Register a channel under an id chosen by the peer
    pub fn register(
        &self,
        id: ChannelId,
        kind: GroupKind,
        port: u16,
    ) -> Result<ChannelLease, ChannelError> {
        let mut table = self.lock();

        match table.slots.get(id.index()) {
            None => Err(ChannelError::CapacityExhausted {
                capacity: self.capacity,
            }),
            Some(Some(_)) => Err(ChannelError::AlreadyAllocated(id)),
            Some(None) => Ok(self.occupy(
                &mut table,
                id,
                kind,
                port,
                ChannelState::Allocated,
            )),
        }
    }

    fn occupy(
        &self,
        table: &mut Table,
        id: ChannelId,
        kind: GroupKind,
        port: u16,
        state: ChannelState,
    ) -> ChannelLease {
        let epoch = Epoch(table.next_epoch);
        table.next_epoch += 1;

        let (to_socket_tx, to_socket_rx) = mpsc::channel(self.queue_depth);
        let cancel = CancellationToken::new();

        table.slots[id.index()] = Some(Slot {
            epoch,
            port,
            kind,
            state,
            close_sent: false,
            to_socket: to_socket_tx,
            cancel: cancel.clone(),
        });
        table.live += 1;

        ChannelLease {
            id,
            epoch,
            port,
            kind,
            cancel,
            to_socket: to_socket_rx,
        }
    }

    /// Current state of a channel (`Closed` if the id is free)
    pub fn state(&self, id: ChannelId) -> ChannelState {
        self.lock()
            .slots
            .get(id.index())
            .and_then(Option::as_ref)
            .map_or(ChannelState::Closed, |slot| slot.state)
    }

    /// Whether `epoch` is the incarnation currently holding `id`
    pub fn is_current(&self, id: ChannelId, epoch: Epoch) -> bool {
        self.lock()
            .slots
            .get(id.index())
            .and_then(Option::as_ref)
            .is_some_and(|slot| slot.epoch == epoch)
    }

    /// Whether traffic of `epoch` may still go to the peer
    ///
    /// False once the incarnation's CONNECTION_CLOSE has been sent.
    pub fn can_send(&self, id: ChannelId, epoch: Epoch) -> bool {
        self.lock()
            .slots
            .get(id.index())
            .and_then(Option::as_ref)
            .is_some_and(|slot| slot.epoch == epoch && !slot.close_sent)
    }

    /// Record that the channel's local socket is connected
    pub fn mark_established(&self, id: ChannelId, epoch: Epoch) -> bool {
        let mut table = self.lock();
        match Self::current_slot(&mut table, id, epoch) {
            Some(slot) if slot.state == ChannelState::Allocated => {
                slot.state = ChannelState::Established;
                true
            }
            _ => false,
        }
    }

    /// Move a channel to `Closing`
    ///
    /// Returns true only for the call that performs the transition, so a
    /// channel whose reader and writer both fail announces its close once.
    pub fn mark_closing(&self, id: ChannelId, epoch: Epoch) -> bool {
        let mut table = self.lock();
        match Self::current_slot(&mut table, id, epoch) {
            Some(slot) if slot.state.accepts_data() => {
                slot.state = ChannelState::Closing;
                true
            }
            _ => false,
        }
    }

    /// Record that this side's CONNECTION_CLOSE is going out
    ///
    /// Stops the channel's socket tasks but keeps the id reserved until the
    /// peer's close arrives. Returns true only for the first call of the
    /// current incarnation.
    pub fn mark_close_sent(&self, id: ChannelId, epoch: Epoch) -> bool {
        let mut table = self.lock();
        match Self::current_slot(&mut table, id, epoch) {
            Some(slot) if !slot.close_sent => {
                slot.state = ChannelState::Closing;
                slot.close_sent = true;
                slot.cancel.cancel();
                true
            }
            _ => false,
        }
    }

    fn current_slot(table: &mut Table, id: ChannelId, epoch: Epoch) -> Option<&mut Slot> {
        table
            .slots
            .get_mut(id.index())
            .and_then(Option::as_mut)
            .filter(|slot| slot.epoch == epoch)
    }

    /// Queue peer data for the channel's local socket
    ///
    /// A full queue moves the channel to `Closing` instead of buffering more.
    pub fn deliver(&self, id: ChannelId, data: Bytes) -> Delivery {
        let mut table = self.lock();
        let Some(slot) = table.slots.get_mut(id.index()).and_then(Option::as_mut) else {
            return Delivery::Unknown;
        };

        if !slot.state.accepts_data() {
            return Delivery::Closing;
        }

        match slot.to_socket.try_send(data) {
            Ok(()) => Delivery::Queued,
            Err(TrySendError::Full(_)) => {
                slot.state = ChannelState::Closing;
                Delivery::Overflow {
                    epoch: slot.epoch,
                    port: slot.port,
                }
            }
            Err(TrySendError::Closed(_)) => Delivery::WriterGone,
        }
    }

    /// Free an id, whatever incarnation holds it
    ///
    /// Cancels the channel's socket tasks. Returns `None` if the id was
    /// already free.
    pub fn release(&self, id: ChannelId) -> Option<ReleasedChannel> {
        let mut table = self.lock();
        let slot = table.slots.get_mut(id.index())?.take()?;
        table.live -= 1;
        slot.cancel.cancel();

        Some(ReleasedChannel {
            id,
            epoch: slot.epoch,
            port: slot.port,
            kind: slot.kind,
            state: slot.state,
            close_sent: slot.close_sent,
        })
    }

    /// Ids of all live channels, lowest first
    pub fn live_ids(&self) -> Vec<ChannelId> {
        self.lock()
            .slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_some())
            .filter_map(|(index, _)| ChannelId::from_index(index))
            .collect()
    }

    /// Release every channel, returning how many were live
    pub fn clear(&self) -> usize {
        let mut table = self.lock();
        let mut released = 0;
        for slot in table.slots.iter_mut() {
            if let Some(slot) = slot.take() {
                slot.cancel.cancel();
                released += 1;
            }
        }
        table.live = 0;
        released
    }
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    fn id(n: u8) -> ChannelId {
        ChannelId::new(n).unwrap()
    }

    fn allocate(registry: &ChannelRegistry) -> ChannelLease {
        registry
            .allocate(GroupKind::Listener, 22, ChannelState::Established)
            .unwrap()
    }

    #[test]
    fn test_allocates_lowest_free_id() {
        let registry = ChannelRegistry::new();
        let a = allocate(&registry);
        let b = allocate(&registry);
        let c = allocate(&registry);
        assert_eq!((a.id, b.id, c.id), (id(0), id(1), id(2)));

        registry.release(id(1)).unwrap();
        assert_eq!(allocate(&registry).id, id(1));
        assert_eq!(allocate(&registry).id, id(3));

        registry.release(id(0)).unwrap();
        registry.release(id(2)).unwrap();
        assert_eq!(allocate(&registry).id, id(0));
        assert_eq!(allocate(&registry).id, id(2));
    }

    #[test]
    fn test_capacity_boundary() {
        let registry = ChannelRegistry::new();
        let leases: Vec<_> = (0..MAX_CHANNELS).map(|_| allocate(&registry)).collect();
        assert_eq!(registry.len(), MAX_CHANNELS);
        assert_eq!(leases.last().unwrap().id, id(254));

        let err = registry
            .allocate(GroupKind::Listener, 22, ChannelState::Established)
            .unwrap_err();
        assert!(matches!(err, ChannelError::CapacityExhausted { capacity: 255 }));
        assert!(err.is_capacity());

        registry.release(id(100)).unwrap();
        assert_eq!(allocate(&registry).id, id(100));
        assert!(registry
            .allocate(GroupKind::Listener, 22, ChannelState::Established)
            .is_err());
    }

    #[test]
    fn test_epochs_distinguish_incarnations() {
        let registry = ChannelRegistry::new();
        let first = allocate(&registry);
        registry.release(first.id).unwrap();
        assert!(first.cancel.is_cancelled());

        let second = allocate(&registry);
        assert_eq!(second.id, first.id);
        assert_ne!(second.epoch, first.epoch);

        assert!(!registry.is_current(first.id, first.epoch));
        assert!(registry.is_current(second.id, second.epoch));
        assert!(!registry.can_send(first.id, first.epoch));
        assert!(!registry.mark_close_sent(first.id, first.epoch));
        assert_eq!(registry.state(second.id), ChannelState::Established);
    }

    #[test]
    fn test_release_is_idempotent() {
        let registry = ChannelRegistry::new();
        let lease = allocate(&registry);
        let released = registry.release(lease.id).unwrap();
        assert_eq!(released.port, 22);
        assert_eq!(released.kind, GroupKind::Listener);
        assert!(!released.close_sent);
        assert!(registry.release(lease.id).is_none());
        assert_eq!(registry.state(lease.id), ChannelState::Closed);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_sent_close_holds_id_until_peer_close() {
        let registry = ChannelRegistry::new();
        let lease = allocate(&registry);
        assert!(registry.can_send(lease.id, lease.epoch));

        assert!(registry.mark_close_sent(lease.id, lease.epoch));
        assert!(!registry.mark_close_sent(lease.id, lease.epoch));
        assert!(lease.cancel.is_cancelled());
        assert!(!registry.can_send(lease.id, lease.epoch));
        assert_eq!(registry.state(lease.id), ChannelState::Closing);
        assert_eq!(registry.deliver(lease.id, Bytes::from("old")), Delivery::Closing);

        // The id stays reserved while the close is unanswered
        assert_eq!(allocate(&registry).id, id(1));

        let released = registry.release(lease.id).unwrap();
        assert!(released.close_sent);
        assert_eq!(allocate(&registry).id, id(0));
    }

    #[test]
    fn test_full_queue_closes_channel() {
        let registry = ChannelRegistry::new().with_queue_depth(2);
        let lease = allocate(&registry);

        assert_eq!(registry.deliver(lease.id, Bytes::from("a")), Delivery::Queued);
        assert_eq!(registry.deliver(lease.id, Bytes::from("b")), Delivery::Queued);
        assert_eq!(
            registry.deliver(lease.id, Bytes::from("c")),
            Delivery::Overflow {
                epoch: lease.epoch,
                port: 22
            }
        );
        assert_eq!(registry.state(lease.id), ChannelState::Closing);
        assert_eq!(registry.deliver(lease.id, Bytes::from("d")), Delivery::Closing);

        // The reader's own close is not announced a second time
        assert!(!registry.mark_closing(lease.id, lease.epoch));
        assert!(registry.mark_close_sent(lease.id, lease.epoch));
    }

    #[test]
    fn test_register_peer_chosen_id() {
        let registry = ChannelRegistry::new();
        let lease = registry.register(id(7), GroupKind::Forwarder, 22).unwrap();
        assert_eq!(registry.state(id(7)), ChannelState::Allocated);

        assert!(matches!(
            registry.register(id(7), GroupKind::Forwarder, 22),
            Err(ChannelError::AlreadyAllocated(_))
        ));

        assert!(registry.mark_established(lease.id, lease.epoch));
        assert!(!registry.mark_established(lease.id, lease.epoch));
        assert_eq!(registry.state(id(7)), ChannelState::Established);

        // Local allocation skips the peer-held id
        for expected in 0..7 {
            assert_eq!(allocate(&registry).id, id(expected));
        }
        assert_eq!(allocate(&registry).id, id(8));
    }

    #[test]
    fn test_register_outside_capacity() {
        let registry = ChannelRegistry::with_capacity(4);
        assert!(matches!(
            registry.register(id(4), GroupKind::Forwarder, 22),
            Err(ChannelError::CapacityExhausted { capacity: 4 })
        ));
    }

    #[test]
    fn test_deliver_follows_state() {
        let registry = ChannelRegistry::new();
        let mut lease = allocate(&registry);

        assert_eq!(registry.deliver(lease.id, Bytes::from("a")), Delivery::Queued);
        assert_eq!(lease.to_socket.try_recv().unwrap(), "a");

        assert!(registry.mark_closing(lease.id, lease.epoch));
        assert!(!registry.mark_closing(lease.id, lease.epoch));
        assert_eq!(registry.deliver(lease.id, Bytes::from("b")), Delivery::Closing);

        registry.release(lease.id);
        assert_eq!(registry.deliver(lease.id, Bytes::from("c")), Delivery::Unknown);
    }

    #[test]
    fn test_deliver_after_writer_exit() {
        let registry = ChannelRegistry::new();
        let lease = registry.register(id(3), GroupKind::Forwarder, 22).unwrap();
        drop(lease);
        assert_eq!(registry.deliver(id(3), Bytes::from("x")), Delivery::WriterGone);
    }

    #[test]
    fn test_clear_cancels_everything() {
        let registry = ChannelRegistry::new();
        let leases: Vec<_> = (0..5).map(|_| allocate(&registry)).collect();
        assert_eq!(registry.clear(), 5);
        assert!(registry.is_empty());
        assert!(leases.iter().all(|lease| lease.cancel.is_cancelled()));
        assert!(registry.live_ids().is_empty());
    }

    #[test]
    fn test_concurrent_allocation_never_duplicates() {
        let registry = Arc::new(ChannelRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    let mut ids = Vec::new();
                    for _ in 0..40 {
                        if let Ok(lease) =
                            registry.allocate(GroupKind::Listener, 22, ChannelState::Established)
                        {
                            ids.push(lease.id);
                        }
                    }
                    ids
                })
            })
            .collect();

        let mut seen = HashSet::new();
        let mut total = 0;
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(seen.insert(id), "duplicate id {}", id);
                total += 1;
            }
        }
        assert_eq!(total, MAX_CHANNELS);
        assert_eq!(registry.len(), MAX_CHANNELS);
    }
}
