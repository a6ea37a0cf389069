//! Transport connection to the server

mod connector;
mod reconnect;

pub use connector::{ConnectionError, TunnelConnector};
pub use reconnect::ExponentialBackoff;
