//! Exchanges are the unit of interaction between a client and a server: one request, possibly
//!  spread over several datagrams, and the matching response. They are plain state machines
//!  without I/O, driven by the channels.

pub mod client;
pub mod payload;
pub mod pool;
pub mod server;
