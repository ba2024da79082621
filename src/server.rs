use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use anyhow::bail;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::info;
use crate::buffers::buffer_pool::BufferPool;
use crate::channel::server_channel::ServerChannel;
use crate::config::UdpConfig;
use crate::exchange::pool::ExchangePool;
use crate::handler::RaftRpcHandler;

/// The answering side of the protocol. A server binds a single socket, and hands every
///  completely received request to a [RaftRpcHandler]. It never initiates exchanges.
pub struct Server {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    config: Arc<UdpConfig>,
    buffer_pool: Arc<BufferPool>,
    shutdown: CancellationToken,
    channel: Mutex<Option<Arc<ServerChannel>>>,
}

impl Server {
    pub async fn new(bind_addr: SocketAddr, config: Arc<UdpConfig>, buffer_pool: Arc<BufferPool>) -> anyhow::Result<Server> {
        config.validate()?;
        if buffer_pool.buf_size() < config.max_datagram_size {
            bail!("buffer size {} is smaller than the maximum datagram size {}", buffer_pool.buf_size(), config.max_datagram_size);
        }

        let socket = Arc::new(UdpSocket::bind(bind_addr).await?);
        let local_addr = socket.local_addr()?;
        info!("bound server socket to {:?}", local_addr);

        Ok(Server {
            socket,
            local_addr,
            config,
            buffer_pool,
            shutdown: CancellationToken::new(),
            channel: Mutex::new(None),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Starts the receive loops. A server can be started only once.
    pub fn start(&self, handler: Arc<dyn RaftRpcHandler>, exchange_pool: Arc<dyn ExchangePool>) -> anyhow::Result<()> {
        let mut channel = self.channel.lock().unwrap();
        if channel.is_some() {
            bail!("server on {:?} was started before", self.local_addr);
        }
        if self.shutdown.is_cancelled() {
            bail!("server on {:?} was shut down", self.local_addr);
        }

        info!("starting server on {:?} with {} receive loops", self.local_addr, self.config.channel_count);
        *channel = Some(ServerChannel::start(
            self.socket.clone(),
            self.config.clone(),
            self.buffer_pool.clone(),
            exchange_pool,
            handler,
            self.shutdown.child_token(),
        ));
        Ok(())
    }

    /// Stops accepting datagrams. Handlers that are running observe cancellation, and their
    ///  responses are sent on a best-effort basis.
    pub async fn shutdown(&self) {
        info!("shutting down server on {:?}", self.local_addr);
        self.shutdown.cancel();

        let channel = self.channel.lock().unwrap().clone();
        if let Some(channel) = channel {
            channel.close().await;
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
