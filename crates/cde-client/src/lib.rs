//! cde-client: the client role of the cde tunnel
//!
//! The client makes one outbound connection to the server and exposes
//! remote ports on local listeners. Every local TCP connection becomes a
//! channel that the server connects to the matching service on its side.

pub mod client;
pub mod router;
pub mod session;
pub mod tunnel;

pub use client::TunnelClient;
pub use router::ClientRouter;
pub use session::{run_session, Forward, Session};
