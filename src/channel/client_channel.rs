use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;
use anyhow::bail;
use rustc_hash::FxHashMap;
use tokio::net::UdpSocket;
use tokio::select;
use tokio::sync::{oneshot, Mutex};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, span, trace, warn, Instrument, Level, Span};
use crate::buffers::buffer_pool::BufferPool;
use crate::buffers::fixed_buffer::FixedBuf;
use crate::channel::send_socket::{is_transient, SendSocket};
use crate::client::ExchangeHandle;
use crate::config::UdpConfig;
use crate::error::{ExchangeError, RpcError};
use crate::exchange::client::{ClientExchange, ClientExchangeState, ResponseStep};
use crate::exchange::payload::ExchangeResponse;
use crate::packet_header::{MessageKind, PacketFlags, PacketHeader};
use crate::util::safe_converter::PrecheckedCast;

type ExchangeResult = Result<ExchangeResponse, RpcError>;

/// Client-side bookkeeping for an exchange between enqueueing and its result
struct InFlight {
    exchange: ClientExchange,
    result_sender: oneshot::Sender<ExchangeResult>,
    deadline: Instant,
    /// the datagram sent most recently, kept for retransmission
    last_datagram: FixedBuf,
    /// parity of the most recent datagram: the server's answer must echo it
    last_odd: bool,
    last_sent_at: Instant,
    retransmissions: u32,
    /// cancelled when the exchange leaves the in-flight table
    done: CancellationToken,
}

/// A client channel owns a UDP socket connected to the server, and has a receive loop that
///  correlates the server's datagrams with in-flight exchanges. A second loop checks
///  exchanges for expired deadlines and retransmission.
///
/// Exchanges are driven stop-and-wait: every datagram the client sends is answered by exactly
///  one datagram from the server, and the next datagram of an exchange is sent only when that
///  answer arrived. The client flips the [PacketFlags::ODD_SEQUENCE] bit with every datagram
///  it sends for an exchange, which allows both sides to recognize duplicates.
pub struct ClientChannel {
    channel_id: usize,
    server_addr: SocketAddr,
    receive_socket: Arc<UdpSocket>,
    send_socket: Arc<dyn SendSocket>,
    config: Arc<UdpConfig>,
    buffer_pool: Arc<BufferPool>,
    next_correlation_id: AtomicU64,
    in_flight: Mutex<FxHashMap<u64, InFlight>>,
    closed: CancellationToken,
}

impl ClientChannel {
    /// Binds a new socket and connects it to the server, so that the operating system reports
    ///  unreachable servers and filters datagrams from other senders.
    pub async fn new(channel_id: usize, server_addr: SocketAddr, config: Arc<UdpConfig>, buffer_pool: Arc<BufferPool>, shutdown: CancellationToken) -> anyhow::Result<Arc<ClientChannel>> {
        let bind_addr: SocketAddr = if server_addr.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        }
        else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };

        let socket = Arc::new(UdpSocket::bind(bind_addr).await?);
        socket.connect(server_addr).await?;
        debug!("channel {}: bound to {:?}, connected to {:?}", channel_id, socket.local_addr()?, server_addr);

        Self::with_sockets(channel_id, server_addr, socket.clone(), socket, config, buffer_pool, shutdown)
    }

    /// creates the channel and spawns its loops
    pub(crate) fn with_sockets(
        channel_id: usize,
        server_addr: SocketAddr,
        receive_socket: Arc<UdpSocket>,
        send_socket: Arc<dyn SendSocket>,
        config: Arc<UdpConfig>,
        buffer_pool: Arc<BufferPool>,
        shutdown: CancellationToken,
    ) -> anyhow::Result<Arc<ClientChannel>> {
        let channel = Arc::new(ClientChannel {
            channel_id,
            server_addr,
            receive_socket,
            send_socket,
            config,
            buffer_pool,
            next_correlation_id: AtomicU64::new(Self::initial_correlation_id()?),
            in_flight: Default::default(),
            closed: shutdown,
        });

        tokio::spawn(channel.clone().recv_loop());
        tokio::spawn(channel.clone().sweep_loop());
        Ok(channel)
    }

    /// Correlation ids start at a timestamp-based offset, so that a restarted client reusing a
    ///  port does not collide with exchanges the server still remembers.
    fn initial_correlation_id() -> anyhow::Result<u64> {
        let millis = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)?
            .as_millis();

        if millis > 0xffff_ffff_ffff {
            bail!("system clock is in the future");
        }
        Ok((millis as u64) << 16)
    }

    pub fn channel_id(&self) -> usize {
        self.channel_id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub async fn num_in_flight(&self) -> usize {
        self.in_flight.lock().await.len()
    }

    /// Hands an exchange to this channel, sending its first datagram. The returned handle
    ///  resolves exactly once with the exchange's outcome.
    ///
    /// If `cancel` is triggered before the exchange completes, the exchange fails with
    ///  [RpcError::Cancelled], and a late response is dropped.
    pub async fn enqueue(self: &Arc<Self>, mut exchange: ClientExchange, cancel: CancellationToken) -> ExchangeHandle {
        let (result_sender, handle) = ExchangeHandle::new();

        if self.is_closed() {
            let _ = result_sender.send(Err(RpcError::ChannelClosed));
            return handle;
        }
        if cancel.is_cancelled() {
            debug!("{:?} was cancelled before it was sent", exchange);
            exchange.cancel();
            let _ = result_sender.send(Err(RpcError::Cancelled));
            return handle;
        }
        if let Err(e) = exchange.on_enqueued() {
            let _ = result_sender.send(Err(e.into()));
            return handle;
        }

        let correlation_id = self.next_correlation_id.fetch_add(1, Ordering::Relaxed);
        let span = span!(Level::TRACE, "exchange", channel_id = self.channel_id, correlation_id);
        self.start_exchange(exchange, correlation_id, result_sender, cancel)
            .instrument(span)
            .await;
        handle
    }

    async fn start_exchange(self: &Arc<Self>, mut exchange: ClientExchange, correlation_id: u64, result_sender: oneshot::Sender<ExchangeResult>, cancel: CancellationToken) {
        let mut buf = self.buffer_pool.get_from_pool();
        if let Err(e) = self.write_request_fragment(&mut exchange, &mut buf, correlation_id, false) {
            debug!("{:?} failed before sending: {}", exchange, e);
            self.buffer_pool.return_to_pool(buf);
            let _ = result_sender.send(Err(e.into()));
            return;
        }

        let done = CancellationToken::new();
        {
            let mut in_flight = self.in_flight.lock().await;
            if self.is_closed() {
                self.buffer_pool.return_to_pool(buf);
                let _ = result_sender.send(Err(RpcError::ChannelClosed));
                return;
            }

            let now = Instant::now();
            in_flight.insert(correlation_id, InFlight {
                exchange,
                result_sender,
                deadline: now + self.config.response_timeout,
                last_datagram: buf,
                last_odd: false,
                last_sent_at: now,
                retransmissions: 0,
                done: done.clone(),
            });
            self.send_last_datagram(&mut in_flight, correlation_id).await;
        }

        let channel = self.clone();
        tokio::spawn(async move {
            select! {
                _ = cancel.cancelled() => channel.cancel_exchange(correlation_id).await,
                _ = done.cancelled() => {}
            }
        }.instrument(Span::current()));
    }

    fn write_request_fragment(&self, exchange: &mut ClientExchange, buf: &mut FixedBuf, correlation_id: u64, odd: bool) -> Result<(), ExchangeError> {
        let flags = exchange.write_request_fragment(buf, self.config.max_payload_len())?;
        let header = PacketHeader::new(exchange.kind(), flags | PacketFlags::parity(odd), correlation_id, buf.payload_len().prechecked_cast());
        buf.finish_datagram(&header);
        Ok(())
    }

    fn write_ack(buf: &mut FixedBuf, correlation_id: u64, odd: bool) {
        buf.start_datagram();
        buf.finish_datagram(&PacketHeader::new(MessageKind::Ack, PacketFlags::parity(odd), correlation_id, 0));
    }

    async fn send_last_datagram(&self, in_flight: &mut FxHashMap<u64, InFlight>, correlation_id: u64) {
        let result = match in_flight.get_mut(&correlation_id) {
            Some(entry) => {
                entry.last_sent_at = Instant::now();
                self.send_socket.send_datagram(self.server_addr, entry.last_datagram.as_ref()).await
            }
            None => return,
        };

        if let Err(e) = result {
            debug!("error sending datagram for exchange #{}: {}", correlation_id, e);
            self.complete(in_flight, correlation_id, Err(RpcError::from(&e)));
        }
    }

    /// Removes an exchange from the in-flight table and publishes its result
    fn complete(&self, in_flight: &mut FxHashMap<u64, InFlight>, correlation_id: u64, result: ExchangeResult) {
        let Some(mut entry) = in_flight.remove(&correlation_id) else {
            return;
        };

        match &result {
            Ok(_) => {}
            Err(RpcError::Cancelled) => entry.exchange.cancel(),
            Err(_) => entry.exchange.fail(),
        }
        trace!("{:?} #{} finished: {:?}", entry.exchange, correlation_id, result);

        self.buffer_pool.return_to_pool(entry.last_datagram);
        entry.done.cancel();
        if entry.result_sender.send(result).is_err() {
            debug!("exchange #{} finished, but nobody is waiting for its result", correlation_id);
        }
    }

    async fn cancel_exchange(&self, correlation_id: u64) {
        let mut in_flight = self.in_flight.lock().await;
        if in_flight.contains_key(&correlation_id) {
            debug!("exchange #{} was cancelled", correlation_id);
            self.complete(&mut in_flight, correlation_id, Err(RpcError::Cancelled));
        }
    }

    async fn fail_all(&self, error: RpcError) {
        let mut in_flight = self.in_flight.lock().await;
        let correlation_ids = in_flight.keys().copied().collect::<Vec<_>>();
        if !correlation_ids.is_empty() {
            debug!("channel {}: failing {} in-flight exchanges with {}", self.channel_id, correlation_ids.len(), error);
        }
        for correlation_id in correlation_ids {
            self.complete(&mut in_flight, correlation_id, Err(error.clone()));
        }
    }

    /// Closes the channel for good: in-flight exchanges fail, and so do exchanges enqueued
    ///  later
    pub async fn close(&self) {
        self.closed.cancel();
        self.fail_all(RpcError::ChannelClosed).await;
    }

    async fn recv_loop(self: Arc<Self>) {
        debug!("channel {}: starting receive loop", self.channel_id);

        let mut buf = FixedBuf::new(UdpConfig::MAX_DATAGRAM_SIZE);
        loop {
            buf.maximize_len();
            let received = select! {
                _ = self.closed.cancelled() => break,
                r = self.receive_socket.recv(buf.as_mut()) => r,
            };

            match received {
                Ok(num_read) => {
                    buf.truncate(num_read);
                    self.on_datagram(buf.as_ref()).await;
                }
                Err(e) if is_transient(&e) => {
                    debug!("channel {}: {}", self.channel_id, e);
                    self.fail_all(RpcError::from(&e)).await;
                }
                Err(e) => {
                    error!("channel {}: socket error, closing channel: {}", self.channel_id, e);
                    self.fail_all(RpcError::from(&e)).await;
                    self.close().await;
                    break;
                }
            }
        }

        // the sweep has stopped as well: nothing else completes these exchanges
        self.fail_all(RpcError::ChannelClosed).await;
        debug!("channel {}: receive loop terminated", self.channel_id);
    }

    async fn on_datagram(&self, datagram: &[u8]) {
        let header = match PacketHeader::decode(datagram) {
            Ok(header) => header,
            Err(e) => {
                warn!("channel {}: received datagram with unparsable header, dropping: {}", self.channel_id, e);
                return;
            }
        };

        let span = span!(Level::TRACE, "datagram_received", channel_id = self.channel_id, correlation_id = header.correlation_id);
        self.on_packet(header, header.payload(datagram))
            .instrument(span)
            .await
    }

    async fn on_packet(&self, header: PacketHeader, payload: &[u8]) {
        trace!("received {:?}", header);
        if !header.is_response() {
            debug!("{:?} is not from a server - dropping", header);
            return;
        }

        let correlation_id = header.correlation_id;
        let mut in_flight = self.in_flight.lock().await;
        let Some(entry) = in_flight.get_mut(&correlation_id) else {
            debug!("no exchange in flight for {:?} - dropping", header);
            return;
        };
        if header.is_odd() != entry.last_odd {
            trace!("{:?} answers an earlier datagram - dropping", header);
            return;
        }

        let step = entry.exchange.consume_response_fragment(&header, payload);
        let exchange_failed = entry.exchange.state() == ClientExchangeState::Failed;
        match step {
            Ok(ResponseStep::Completed(response)) => {
                self.complete(&mut in_flight, correlation_id, Ok(response));
            }
            Ok(ResponseStep::SendNextRequestFragment) => {
                entry.last_odd = !entry.last_odd;
                let odd = entry.last_odd;
                if let Err(e) = self.write_request_fragment(&mut entry.exchange, &mut entry.last_datagram, correlation_id, odd) {
                    debug!("exchange #{} failed: {}", correlation_id, e);
                    self.complete(&mut in_flight, correlation_id, Err(e.into()));
                    return;
                }
                self.send_last_datagram(&mut in_flight, correlation_id).await;
            }
            Ok(ResponseStep::Acknowledge) => {
                entry.last_odd = !entry.last_odd;
                Self::write_ack(&mut entry.last_datagram, correlation_id, entry.last_odd);
                self.send_last_datagram(&mut in_flight, correlation_id).await;
            }
            Err(e) if exchange_failed => {
                warn!("exchange #{} failed: {}", correlation_id, e);
                self.complete(&mut in_flight, correlation_id, Err(e.into()));
            }
            Err(e) => {
                debug!("dropping {:?}: {}", header, e);
            }
        }
    }

    async fn sweep_loop(self: Arc<Self>) {
        let mut interval = interval(self.config.retry_policy.sweep_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            select! {
                _ = self.closed.cancelled() => break,
                _ = interval.tick() => {}
            }
            self.sweep().await;
        }
        debug!("channel {}: sweep loop terminated", self.channel_id);
    }

    async fn sweep(&self) {
        let policy = &self.config.retry_policy;
        let now = Instant::now();
        let mut in_flight = self.in_flight.lock().await;

        let expired = in_flight.iter()
            .filter(|(_, entry)| entry.deadline <= now)
            .map(|(&correlation_id, _)| correlation_id)
            .collect::<Vec<_>>();
        for correlation_id in expired {
            debug!("exchange #{} timed out", correlation_id);
            self.complete(&mut in_flight, correlation_id, Err(RpcError::Timeout));
        }

        let unanswered = in_flight.iter_mut()
            .filter_map(|(&correlation_id, entry)| {
                if entry.retransmissions < policy.max_retransmissions && now.duration_since(entry.last_sent_at) >= policy.retransmit_after {
                    entry.retransmissions += 1;
                    Some(correlation_id)
                }
                else {
                    None
                }
            })
            .collect::<Vec<_>>();
        for correlation_id in unanswered {
            debug!("exchange #{}: retransmitting unanswered datagram", correlation_id);
            self.send_last_datagram(&mut in_flight, correlation_id).await;
        }
    }
}
