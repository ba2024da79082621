//! Request / response exchanges over UDP for the RPCs of a Raft cluster: vote requests,
//!  heartbeats carrying log entries, leader resignation and metadata queries.
//!
//! A [client::Client] sends exchanges to a single [server::Server], which passes each complete
//!  request to a [handler::RaftRpcHandler] and sends back its result. Payloads that do not fit
//!  into a datagram are fragmented, and fragments are exchanged stop-and-wait with
//!  retransmission, so each exchange either completes or fails with a definite
//!  [error::RpcError].

pub mod buffers;
pub mod channel;
pub mod client;
pub mod config;
pub mod error;
pub mod exchange;
pub mod handler;
pub mod log_entry;
pub mod packet_header;
pub mod server;
pub mod util;
