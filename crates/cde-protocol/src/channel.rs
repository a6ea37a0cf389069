//! Channel identifier types

use std::fmt;

/// Number of channels that can be live at once on one endpoint.
///
/// The channel id travels as a single header byte and 255 is reserved, so
/// ids run from 0 to 254. Widening this limit means widening the header.
pub const MAX_CHANNELS: usize = 255;

/// Identifier of one multiplexed TCP stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(u8);

impl ChannelId {
    /// Reserved id, never allocated
    pub const RESERVED: u8 = 0xFF;

    /// Id written for messages that are not bound to a channel (INIT, INIT_ACK)
    pub const CONTROL: ChannelId = ChannelId(0);

    /// Create a channel id, rejecting the reserved value
    pub fn new(id: u8) -> Option<Self> {
        (id != Self::RESERVED).then_some(Self(id))
    }

    /// Map a registry slot index to its channel id
    pub fn from_index(index: usize) -> Option<Self> {
        if index < MAX_CHANNELS {
            Some(Self(index as u8))
        } else {
            None
        }
    }

    /// Raw wire value
    pub fn as_u8(&self) -> u8 {
        self.0
    }

    /// Registry slot index for this id
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "channel-{}", self.0)
    }
}

/// Incarnation counter for a channel id.
///
/// Ids are reused as soon as they are freed. Every allocation gets a fresh
/// epoch, so traffic produced by an old incarnation can be told apart from
/// traffic of the one that currently holds the id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Epoch(pub u64);

impl Epoch {
    /// Epoch of locally produced messages that are not bound to a channel
    pub const CONTROL: Epoch = Epoch(0);
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "epoch-{}", self.0)
    }
}
