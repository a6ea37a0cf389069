//! cde-core: Multiplexing engine shared by the cde client and server
//!
//! This crate holds everything both endpoint roles have in common: the
//! channel registry and port groups, the per-channel socket tasks, the
//! transport abstraction with its implementations, the message
//! demultiplexer, and configuration.

pub mod channel;
pub mod config;
pub mod demux;
pub mod endpoint;
pub mod error;
pub mod port_group;
pub mod ports;
pub mod registry;
pub mod transport;

pub use endpoint::{Bus, Endpoint};
pub use error::{ChannelError, ConfigError, TransportError};
pub use port_group::{GroupKind, PortGroup, PortGroupManager};
pub use registry::{ChannelRegistry, ChannelState};
