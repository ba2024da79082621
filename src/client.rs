use std::collections::BTreeMap;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use anyhow::bail;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::info;
use crate::buffers::buffer_pool::BufferPool;
use crate::channel::client_channel::ClientChannel;
use crate::config::UdpConfig;
use crate::error::RpcError;
use crate::exchange::client::ClientExchange;
use crate::exchange::payload::ExchangeResponse;
use crate::handler::RaftResult;
use crate::log_entry::LogEntryProducer;

/// The pending outcome of an enqueued exchange. It resolves exactly once.
pub struct ExchangeHandle {
    receiver: oneshot::Receiver<Result<ExchangeResponse, RpcError>>,
}

impl ExchangeHandle {
    pub(crate) fn new() -> (oneshot::Sender<Result<ExchangeResponse, RpcError>>, ExchangeHandle) {
        let (sender, receiver) = oneshot::channel();
        (sender, ExchangeHandle { receiver })
    }
}

impl Future for ExchangeHandle {
    type Output = Result<ExchangeResponse, RpcError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|result| result.unwrap_or(Err(RpcError::ChannelClosed)))
    }
}

/// The initiating side of the protocol. A client talks to a single server through
///  `channel_count` channels, each with its own socket, and spreads exchanges across them
///  round-robin.
pub struct Client {
    server_addr: SocketAddr,
    channels: Vec<Arc<ClientChannel>>,
    next_channel: AtomicUsize,
    shutdown: CancellationToken,
}

impl Client {
    pub async fn new(server_addr: SocketAddr, config: Arc<UdpConfig>, buffer_pool: Arc<BufferPool>) -> anyhow::Result<Client> {
        config.validate()?;
        if buffer_pool.buf_size() < config.max_datagram_size {
            bail!("buffer size {} is smaller than the maximum datagram size {}", buffer_pool.buf_size(), config.max_datagram_size);
        }

        let shutdown = CancellationToken::new();
        let mut channels = Vec::with_capacity(config.channel_count);
        for channel_id in 0..config.channel_count {
            match ClientChannel::new(channel_id, server_addr, config.clone(), buffer_pool.clone(), shutdown.child_token()).await {
                Ok(channel) => channels.push(channel),
                Err(e) => {
                    shutdown.cancel();
                    return Err(e);
                }
            }
        }

        info!("client for {:?} started with {} channels", server_addr, channels.len());
        Ok(Client {
            server_addr,
            channels,
            next_channel: AtomicUsize::new(0),
            shutdown,
        })
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.server_addr
    }

    /// Sends an exchange on the next channel. The returned handle resolves with the server's
    ///  response, or with the reason why there is none.
    pub async fn enqueue(&self, exchange: ClientExchange, cancel: CancellationToken) -> ExchangeHandle {
        let idx = self.next_channel.fetch_add(1, Ordering::Relaxed) % self.channels.len();
        self.channels[idx].enqueue(exchange, cancel).await
    }

    pub async fn vote(&self, term: i64, last_log_index: i64, last_log_term: i64, cancel: CancellationToken) -> Result<RaftResult<bool>, RpcError> {
        match self.enqueue(ClientExchange::vote(term, last_log_index, last_log_term), cancel).await.await? {
            ExchangeResponse::Vote(result) => Ok(result),
            other => Err(Self::mismatch(other)),
        }
    }

    pub async fn heartbeat(&self, term: i64, prev_log_index: i64, prev_log_term: i64, commit_index: i64, entries: impl LogEntryProducer, cancel: CancellationToken) -> Result<RaftResult<bool>, RpcError> {
        match self.enqueue(ClientExchange::heartbeat(term, prev_log_index, prev_log_term, commit_index, entries), cancel).await.await? {
            ExchangeResponse::Heartbeat(result) => Ok(result),
            other => Err(Self::mismatch(other)),
        }
    }

    pub async fn resign(&self, cancel: CancellationToken) -> Result<bool, RpcError> {
        match self.enqueue(ClientExchange::resign(), cancel).await.await? {
            ExchangeResponse::Resign(result) => Ok(result),
            other => Err(Self::mismatch(other)),
        }
    }

    pub async fn metadata(&self, cancel: CancellationToken) -> Result<Arc<BTreeMap<String, String>>, RpcError> {
        match self.enqueue(ClientExchange::metadata(), cancel).await.await? {
            ExchangeResponse::Metadata(result) => Ok(result),
            other => Err(Self::mismatch(other)),
        }
    }

    fn mismatch(response: ExchangeResponse) -> RpcError {
        RpcError::ProtocolViolation(format!("unexpected {:?} response", response.kind()))
    }

    /// Stops all channels. Exchanges in flight fail with [RpcError::ChannelClosed], and so do
    ///  all exchanges enqueued afterwards.
    pub async fn shutdown(&self) {
        info!("shutting down client for {:?}", self.server_addr);
        self.shutdown.cancel();
        for channel in &self.channels {
            channel.close().await;
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
