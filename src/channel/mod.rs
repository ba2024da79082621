//! Channels move datagrams between sockets and exchanges. A client has one channel per socket,
//!  a server runs several receive loops on a single socket.

pub mod client_channel;
pub mod send_socket;
pub mod server_channel;
