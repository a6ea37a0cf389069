//! cde-server: the server role of the cde tunnel
//!
//! The server accepts one transport connection per client. For each
//! connection it acknowledges the handshake and dials local services on the
//! client's behalf, one forwarder channel per tunneled TCP connection.

pub mod listener;
pub mod router;

pub use listener::{serve_connection, TunnelServer};
pub use router::ServerRouter;
