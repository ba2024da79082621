use std::net::SocketAddr;
use std::sync::Arc;
use rustc_hash::FxHashMap;
use tokio::net::UdpSocket;
use tokio::select;
use tokio::sync::Mutex;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, span, trace, warn, Instrument, Level};
use crate::buffers::buffer_pool::BufferPool;
use crate::buffers::fixed_buffer::FixedBuf;
use crate::channel::send_socket::{is_transient, SendSocket};
use crate::config::UdpConfig;
use crate::error::ExchangeError;
use crate::exchange::pool::ExchangePool;
use crate::exchange::server::{ServerExchange, ServerExchangeState};
use crate::handler::RaftRpcHandler;
use crate::packet_header::{MessageKind, PacketFlags, PacketHeader};
use crate::util::safe_converter::PrecheckedCast;

/// exchanges are identified by the client's address and the client-assigned correlation id
type ExchangeKey = (SocketAddr, u64);

enum Slot {
    Active(ActiveExchange),
    /// the exchange is owned by a task running the handler
    Processing,
    /// the exchange completed and is back in the pool
    Lingering(LingeringResponse),
}

struct ActiveExchange {
    exchange: ServerExchange,
    /// parity of the next datagram the client sends for this exchange
    expected_odd: bool,
    /// the datagram this server sent most recently, re-sent for duplicates
    last_datagram: Option<FixedBuf>,
    last_activity: Instant,
}

/// What remains of a completed exchange: its final datagram, re-sent if the client repeats the
///  datagram it answered
struct LingeringResponse {
    expected_odd: bool,
    last_datagram: FixedBuf,
    completed_at: Instant,
}

/// The receiving side of a server: `channel_count` receive loops on the shared socket, and a
///  table of exchanges that are in progress. Exchanges move out of the table while their
///  handler runs, so that a slow handler does not block the receive loops.
pub struct ServerChannel {
    socket: Arc<UdpSocket>,
    send_socket: Arc<dyn SendSocket>,
    config: Arc<UdpConfig>,
    buffer_pool: Arc<BufferPool>,
    exchange_pool: Arc<dyn ExchangePool>,
    handler: Arc<dyn RaftRpcHandler>,
    exchanges: Mutex<FxHashMap<ExchangeKey, Slot>>,
    shutdown: CancellationToken,
}

impl ServerChannel {
    /// creates the channel and spawns its receive loops and its idle sweep
    pub fn start(
        socket: Arc<UdpSocket>,
        config: Arc<UdpConfig>,
        buffer_pool: Arc<BufferPool>,
        exchange_pool: Arc<dyn ExchangePool>,
        handler: Arc<dyn RaftRpcHandler>,
        shutdown: CancellationToken,
    ) -> Arc<ServerChannel> {
        let channel = Arc::new(ServerChannel {
            socket: socket.clone(),
            send_socket: socket,
            config,
            buffer_pool,
            exchange_pool,
            handler,
            exchanges: Default::default(),
            shutdown,
        });

        for channel_id in 0..channel.config.channel_count {
            tokio::spawn(channel.clone().recv_loop(channel_id));
        }
        tokio::spawn(channel.clone().sweep_loop());
        channel
    }

    pub async fn num_exchanges(&self) -> usize {
        self.exchanges.lock().await.len()
    }

    /// stops all loops and abandons the exchanges that are waiting for the client
    pub async fn close(&self) {
        self.shutdown.cancel();

        let mut exchanges = self.exchanges.lock().await;
        let keys = exchanges.keys().copied().collect::<Vec<_>>();
        for key in keys {
            self.remove(&mut exchanges, key);
        }
    }

    async fn recv_loop(self: Arc<Self>, channel_id: usize) {
        debug!("channel {}: starting receive loop", channel_id);

        let mut buf = FixedBuf::new(UdpConfig::MAX_DATAGRAM_SIZE);
        loop {
            buf.maximize_len();
            let received = select! {
                _ = self.shutdown.cancelled() => break,
                r = self.socket.recv_from(buf.as_mut()) => r,
            };

            let (num_read, from) = match received {
                Ok(x) => x,
                Err(e) if is_transient(&e) => {
                    // a client went away: this refers to some earlier response and is of no
                    //  consequence for the server
                    debug!("channel {}: {}", channel_id, e);
                    continue;
                }
                Err(e) => {
                    error!("channel {}: socket error, terminating receive loop: {}", channel_id, e);
                    break;
                }
            };
            buf.truncate(num_read);

            let header = match PacketHeader::decode(buf.as_ref()) {
                Ok(header) => header,
                Err(e) => {
                    warn!("received datagram with unparsable header from {:?}, dropping: {}", from, e);
                    continue;
                }
            };

            let span = span!(Level::TRACE, "datagram_received", channel_id, ?from, correlation_id = header.correlation_id);
            self.on_packet(from, header, header.payload(buf.as_ref()))
                .instrument(span)
                .await;
        }
        debug!("channel {}: receive loop terminated", channel_id);
    }

    async fn on_packet(self: &Arc<Self>, from: SocketAddr, header: PacketHeader, payload: &[u8]) {
        trace!("received {:?}", header);
        if header.is_response() {
            debug!("{:?} is a response - dropping", header);
            return;
        }

        let key = (from, header.correlation_id);
        let mut exchanges = self.exchanges.lock().await;

        if !exchanges.contains_key(&key) {
            if !header.kind.is_request() || !header.is_stream_start() || header.is_odd() {
                debug!("no exchange for {:?} - dropping", header);
                return;
            }
            let Some(exchange) = self.exchange_pool.try_rent(header.kind) else {
                debug!("{} - dropping {:?}", ExchangeError::PoolExhausted(header.kind), header);
                return;
            };
            exchanges.insert(key, Slot::Active(ActiveExchange {
                exchange,
                expected_odd: false,
                last_datagram: None,
                last_activity: Instant::now(),
            }));
        }

        let active = match exchanges.get_mut(&key) {
            Some(Slot::Active(active)) => active,
            Some(Slot::Processing) => {
                trace!("{:?} arrived while the request is processed - dropping", header);
                return;
            }
            Some(Slot::Lingering(lingering)) => {
                if header.is_odd() != lingering.expected_odd {
                    trace!("{:?} repeats a datagram of a completed exchange - answering it again", header);
                    self.send(from, &lingering.last_datagram).await;
                }
                else {
                    debug!("{:?} arrived after the exchange completed - dropping", header);
                }
                return;
            }
            None => return,
        };

        if header.is_odd() != active.expected_odd {
            trace!("{:?} is a duplicate - answering it again", header);
            if let Some(last_datagram) = &active.last_datagram {
                self.send(from, last_datagram).await;
            }
            return;
        }

        match header.kind {
            MessageKind::Ack => {
                let mut buf = self.buffer_pool.get_from_pool();
                let flags = match active.exchange.write_response_fragment(&mut buf, self.config.max_payload_len()) {
                    Ok(flags) => flags,
                    Err(e) => {
                        debug!("dropping {:?}: {}", header, e);
                        self.buffer_pool.return_to_pool(buf);
                        return;
                    }
                };
                finish_response(&mut buf, flags, header.correlation_id, header.is_odd());
                active.expected_odd = !active.expected_odd;
                active.last_activity = Instant::now();
                if let Some(prev) = active.last_datagram.replace(buf) {
                    self.buffer_pool.return_to_pool(prev);
                }
                if active.exchange.state() == ServerExchangeState::Completed {
                    self.linger(&mut exchanges, key);
                }

                match exchanges.get(&key) {
                    Some(Slot::Active(ActiveExchange { last_datagram: Some(datagram), .. })) => self.send(from, datagram).await,
                    Some(Slot::Lingering(lingering)) => self.send(from, &lingering.last_datagram).await,
                    _ => {}
                }
            }
            MessageKind::Response => {
                debug!("{:?} without response flag - dropping", header);
            }
            kind => {
                if kind != active.exchange.kind() {
                    debug!("{:?} does not belong to {:?} - dropping", header, active.exchange);
                    return;
                }
                if let Err(e) = active.exchange.consume_request_fragment(payload, header.is_stream_end()) {
                    debug!("dropping {:?}: {}", header, e);
                    if active.exchange.state() == ServerExchangeState::Failed {
                        self.remove(&mut exchanges, key);
                    }
                    return;
                }
                active.expected_odd = !active.expected_odd;
                active.last_activity = Instant::now();

                if active.exchange.is_request_complete() {
                    if let Some(Slot::Active(active)) = exchanges.insert(key, Slot::Processing) {
                        if let Some(prev) = active.last_datagram {
                            self.buffer_pool.return_to_pool(prev);
                        }
                        tokio::spawn(self.clone().process(key, active.exchange, header.is_odd()).in_current_span());
                    }
                }
                else {
                    let mut buf = self.buffer_pool.get_from_pool();
                    buf.start_datagram();
                    buf.finish_datagram(&PacketHeader::new(MessageKind::Ack, PacketFlags::IS_RESPONSE | PacketFlags::parity(header.is_odd()), header.correlation_id, 0));
                    self.send(from, &buf).await;
                    if let Some(prev) = active.last_datagram.replace(buf) {
                        self.buffer_pool.return_to_pool(prev);
                    }
                }
            }
        }
    }

    /// Runs the handler for a completely received request, and sends the first response
    ///  fragment. `odd` is the parity of the request's final fragment.
    async fn process(self: Arc<Self>, key: ExchangeKey, mut exchange: ServerExchange, odd: bool) {
        let (from, correlation_id) = key;

        let response = match exchange.invoke_handler(self.handler.as_ref(), from, self.shutdown.child_token()).await {
            Ok(response) => response,
            Err(e) => {
                warn!("{:?}: {}", exchange, e);
                self.discard_processing(key, exchange).await;
                return;
            }
        };
        if let Err(e) = exchange.create_response(&response) {
            warn!("{:?}: {}", exchange, e);
            self.discard_processing(key, exchange).await;
            return;
        }

        let mut buf = self.buffer_pool.get_from_pool();
        let flags = match exchange.write_response_fragment(&mut buf, self.config.max_payload_len()) {
            Ok(flags) => flags,
            Err(e) => {
                warn!("{:?}: {}", exchange, e);
                self.buffer_pool.return_to_pool(buf);
                self.discard_processing(key, exchange).await;
                return;
            }
        };
        finish_response(&mut buf, flags, correlation_id, odd);

        let mut exchanges = self.exchanges.lock().await;
        if !matches!(exchanges.get(&key), Some(Slot::Processing)) {
            debug!("{:?} was discarded while it was processed", exchange);
            self.buffer_pool.return_to_pool(buf);
            exchange.abandon();
            self.exchange_pool.release(exchange);
            return;
        }

        if self.shutdown.is_cancelled() {
            self.send(from, &buf).await;
            exchanges.remove(&key);
            self.buffer_pool.return_to_pool(buf);
            exchange.abandon();
            self.exchange_pool.release(exchange);
            return;
        }

        let completed = exchange.state() == ServerExchangeState::Completed;
        exchanges.insert(key, Slot::Active(ActiveExchange {
            exchange,
            expected_odd: !odd,
            last_datagram: Some(buf),
            last_activity: Instant::now(),
        }));
        if completed {
            self.linger(&mut exchanges, key);
        }

        match exchanges.get(&key) {
            Some(Slot::Active(ActiveExchange { last_datagram: Some(datagram), .. })) => self.send(from, datagram).await,
            Some(Slot::Lingering(lingering)) => self.send(from, &lingering.last_datagram).await,
            _ => {}
        }
    }

    async fn discard_processing(&self, key: ExchangeKey, mut exchange: ServerExchange) {
        self.exchanges.lock().await.remove(&key);
        exchange.abandon();
        self.exchange_pool.release(exchange);
    }

    /// Returns a completed exchange to the pool right away. Only its final datagram stays in the
    ///  table, until `response_linger` expires.
    fn linger(&self, exchanges: &mut FxHashMap<ExchangeKey, Slot>, key: ExchangeKey) {
        let Some(Slot::Active(active)) = exchanges.remove(&key) else {
            return;
        };
        let ActiveExchange { exchange, expected_odd, last_datagram, last_activity } = active;
        trace!("{:?} completed, returning it to the pool", exchange);
        self.exchange_pool.release(exchange);

        if let Some(last_datagram) = last_datagram {
            exchanges.insert(key, Slot::Lingering(LingeringResponse {
                expected_odd,
                last_datagram,
                completed_at: last_activity,
            }));
        }
    }

    /// Removes an exchange that is not being processed from the table. An unfinished exchange
    ///  is abandoned and returned to the pool.
    fn remove(&self, exchanges: &mut FxHashMap<ExchangeKey, Slot>, key: ExchangeKey) {
        if let Some(Slot::Processing) = exchanges.get(&key) {
            return;
        }

        match exchanges.remove(&key) {
            Some(Slot::Active(mut active)) => {
                if let Some(buf) = active.last_datagram.take() {
                    self.buffer_pool.return_to_pool(buf);
                }
                active.exchange.abandon();
                self.exchange_pool.release(active.exchange);
            }
            Some(Slot::Lingering(lingering)) => {
                self.buffer_pool.return_to_pool(lingering.last_datagram);
            }
            Some(Slot::Processing) | None => {}
        }
    }

    async fn send(&self, to: SocketAddr, datagram: &FixedBuf) {
        if let Err(e) = self.send_socket.send_datagram(to, datagram.as_ref()).await {
            debug!("error sending datagram to {:?}: {}", to, e);
        }
    }

    async fn sweep_loop(self: Arc<Self>) {
        let mut interval = interval(self.config.retry_policy.sweep_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            select! {
                _ = self.shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }
            self.sweep().await;
        }
        debug!("idle sweep terminated");
    }

    /// Final datagrams of completed exchanges are kept for `response_linger` to answer
    ///  retransmitted requests, unfinished exchanges are abandoned after `receive_timeout`
    ///  without client activity.
    async fn sweep(&self) {
        let now = Instant::now();
        let mut exchanges = self.exchanges.lock().await;

        let expired = exchanges.iter()
            .filter_map(|(key, slot)| match slot {
                Slot::Active(active) => (now.duration_since(active.last_activity) >= self.config.receive_timeout).then_some(*key),
                Slot::Lingering(lingering) => (now.duration_since(lingering.completed_at) >= self.config.response_linger).then_some(*key),
                Slot::Processing => None,
            })
            .collect::<Vec<_>>();

        for key in expired {
            trace!("removing exchange #{} from {:?}", key.1, key.0);
            self.remove(&mut exchanges, key);
        }
    }
}

/// Fills in the header of a response fragment, echoing the parity of the client datagram it
///  answers
fn finish_response(buf: &mut FixedBuf, flags: PacketFlags, correlation_id: u64, odd: bool) {
    let header = PacketHeader::new(MessageKind::Response, flags | PacketFlags::parity(odd), correlation_id, buf.payload_len().prechecked_cast());
    buf.finish_datagram(&header);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::time::Duration;
    use mockall::predicate::always;
    use crate::exchange::payload::{ExchangeResponse, HeartbeatPrefix, VoteRequest};
    use crate::exchange::pool::{FixedExchangePool, MockExchangePool};
    use crate::handler::{MockRaftRpcHandler, RaftResult};
    use crate::log_entry::{drain_entries, LogEntry};

    /// a socket standing in for the client, sending datagrams by hand
    struct FakeClient {
        socket: UdpSocket,
        server_addr: SocketAddr,
    }
    impl FakeClient {
        async fn new(server_addr: SocketAddr) -> FakeClient {
            FakeClient {
                socket: UdpSocket::bind("127.0.0.1:0").await.unwrap(),
                server_addr,
            }
        }

        async fn send(&self, kind: MessageKind, flags: PacketFlags, correlation_id: u64, payload: &[u8]) {
            let mut buf = PacketHeader::new(kind, flags, correlation_id, payload.len() as u16).encode().to_vec();
            buf.extend_from_slice(payload);
            self.socket.send_to(&buf, self.server_addr).await.unwrap();
        }

        async fn recv(&self) -> (PacketHeader, Vec<u8>) {
            self.try_recv(Duration::from_secs(5)).await
                .expect("no datagram received")
        }

        async fn try_recv(&self, timeout: Duration) -> Option<(PacketHeader, Vec<u8>)> {
            let mut buf = vec![0u8; UdpConfig::MAX_DATAGRAM_SIZE];
            let n = tokio::time::timeout(timeout, self.socket.recv(&mut buf)).await.ok()?.unwrap();
            let header = PacketHeader::decode(&buf[..n]).unwrap();
            Some((header, header.payload(&buf[..n]).to_vec()))
        }
    }

    struct Fixture {
        channel: Arc<ServerChannel>,
        client: FakeClient,
    }

    async fn start(modify_config: impl FnOnce(&mut UdpConfig), exchange_pool: Arc<dyn ExchangePool>, handler: MockRaftRpcHandler) -> Fixture {
        let mut config = UdpConfig::new();
        modify_config(&mut config);
        let config = Arc::new(config);

        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let client = FakeClient::new(socket.local_addr().unwrap()).await;
        let buffer_pool = Arc::new(BufferPool::new(config.max_datagram_size, 16));
        let channel = ServerChannel::start(socket, config, buffer_pool, exchange_pool, Arc::new(handler), CancellationToken::new());
        Fixture { channel, client }
    }

    fn vote_handler(times: usize) -> MockRaftRpcHandler {
        let mut handler = MockRaftRpcHandler::new();
        handler.expect_receive_vote()
            .times(times)
            .returning(|_, term, _, _, _| RaftResult::new(term + 1, true));
        handler
    }

    fn vote_payload(term: i64) -> Vec<u8> {
        let mut buf = Vec::new();
        VoteRequest { term, last_log_index: 1, last_log_term: 56 }.ser(&mut buf);
        buf
    }

    const SINGLE: PacketFlags = PacketFlags::STREAM_START.union(PacketFlags::STREAM_END);

    #[tokio::test]
    async fn test_vote() {
        let f = start(|_| {}, Arc::new(FixedExchangePool::new(4)), vote_handler(1)).await;

        f.client.send(MessageKind::Vote, SINGLE, 77, &vote_payload(42)).await;
        let (header, payload) = f.client.recv().await;

        assert_eq!(header, PacketHeader::new(MessageKind::Response, SINGLE | PacketFlags::IS_RESPONSE, 77, 9));
        assert_eq!(ExchangeResponse::deser(MessageKind::Vote, &payload).unwrap(), ExchangeResponse::Vote(RaftResult::new(43, true)));
    }

    #[tokio::test]
    async fn test_duplicate_request_is_answered_without_calling_the_handler_again() {
        let f = start(|_| {}, Arc::new(FixedExchangePool::new(4)), vote_handler(1)).await;

        f.client.send(MessageKind::Vote, SINGLE, 77, &vote_payload(42)).await;
        let first = f.client.recv().await;
        f.client.send(MessageKind::Vote, SINGLE, 77, &vote_payload(42)).await;
        let second = f.client.recv().await;

        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_completed_exchange_is_returned_to_pool_before_linger_expires() {
        let exchange_pool = Arc::new(FixedExchangePool::new(1));
        let f = start(|_| {}, exchange_pool.clone(), vote_handler(2)).await;

        f.client.send(MessageKind::Vote, SINGLE, 1, &vote_payload(10)).await;
        let first = f.client.recv().await;
        assert_eq!(exchange_pool.num_rented(MessageKind::Vote), 0);

        f.client.send(MessageKind::Vote, SINGLE, 2, &vote_payload(20)).await;
        let (_, payload) = f.client.recv().await;
        assert_eq!(ExchangeResponse::deser(MessageKind::Vote, &payload).unwrap(), ExchangeResponse::Vote(RaftResult::new(21, true)));

        // the first exchange's response is still available for a retransmitted request
        f.client.send(MessageKind::Vote, SINGLE, 1, &vote_payload(10)).await;
        assert_eq!(f.client.recv().await, first);
        assert_eq!(exchange_pool.num_rented(MessageKind::Vote), 0);
    }

    #[tokio::test]
    async fn test_same_correlation_id_from_different_clients() {
        let f = start(|_| {}, Arc::new(FixedExchangePool::new(4)), vote_handler(2)).await;
        let other = FakeClient::new(f.client.server_addr).await;

        f.client.send(MessageKind::Vote, SINGLE, 5, &vote_payload(10)).await;
        other.send(MessageKind::Vote, SINGLE, 5, &vote_payload(20)).await;

        let (_, payload) = f.client.recv().await;
        assert_eq!(ExchangeResponse::deser(MessageKind::Vote, &payload).unwrap(), ExchangeResponse::Vote(RaftResult::new(11, true)));
        let (_, payload) = other.recv().await;
        assert_eq!(ExchangeResponse::deser(MessageKind::Vote, &payload).unwrap(), ExchangeResponse::Vote(RaftResult::new(21, true)));
    }

    #[tokio::test]
    async fn test_fragmented_heartbeat() {
        let mut handler = MockRaftRpcHandler::new();
        handler.expect_receive_entries()
            .once()
            .returning(|_, term, mut entries, _, _, _, _| {
                let terms = drain_entries(entries.as_mut()).iter().map(|e| e.term).collect::<Vec<_>>();
                assert_eq!(terms, vec![1, 2, 3]);
                RaftResult::new(term, true)
            });
        let f = start(|_| {}, Arc::new(FixedExchangePool::new(4)), handler).await;

        let mut first = Vec::new();
        HeartbeatPrefix { term: 42, prev_log_index: 1, prev_log_term: 56, commit_index: 10 }.ser(&mut first);
        LogEntry::new(1, vec![1u8; 10]).ser(&mut first);
        let mut second = Vec::new();
        LogEntry::new(2, vec![2u8; 10]).ser(&mut second);
        LogEntry::new(3, vec![3u8; 10]).ser(&mut second);

        f.client.send(MessageKind::Heartbeat, PacketFlags::STREAM_START, 9, &first).await;
        let (ack, _) = f.client.recv().await;
        assert_eq!(ack, PacketHeader::new(MessageKind::Ack, PacketFlags::IS_RESPONSE, 9, 0));

        // a retransmitted first fragment is acknowledged again, but not consumed twice
        f.client.send(MessageKind::Heartbeat, PacketFlags::STREAM_START, 9, &first).await;
        assert_eq!(f.client.recv().await.0, ack);

        f.client.send(MessageKind::Heartbeat, PacketFlags::STREAM_END | PacketFlags::ODD_SEQUENCE, 9, &second).await;
        let (header, payload) = f.client.recv().await;
        assert_eq!(header.flags, SINGLE | PacketFlags::IS_RESPONSE | PacketFlags::ODD_SEQUENCE);
        assert_eq!(ExchangeResponse::deser(MessageKind::Heartbeat, &payload).unwrap(), ExchangeResponse::Heartbeat(RaftResult::new(42, true)));
    }

    #[tokio::test]
    async fn test_fragmented_response() {
        let metadata: BTreeMap<String, String> = (0..30)
            .map(|i| (format!("key-{}", i), "x".repeat(20)))
            .collect();
        let metadata = Arc::new(metadata);
        let m = metadata.clone();
        let mut handler = MockRaftRpcHandler::new();
        handler.expect_metadata()
            .once()
            .returning(move || m.clone());

        let f = start(|c| c.max_datagram_size = UdpConfig::MIN_DATAGRAM_SIZE, Arc::new(FixedExchangePool::new(4)), handler).await;

        f.client.send(MessageKind::Metadata, SINGLE, 1, &[]).await;
        let mut reassembled = Vec::new();
        let mut num_fragments = 0;
        let last = loop {
            let (header, payload) = f.client.recv().await;
            assert_eq!(header.kind, MessageKind::Response);
            assert_eq!(header.is_odd(), num_fragments % 2 == 1);
            assert!(payload.len() <= UdpConfig::MIN_DATAGRAM_SIZE - PacketHeader::SERIALIZED_LEN);
            reassembled.extend_from_slice(&payload);
            num_fragments += 1;
            if header.is_stream_end() {
                break (header, payload);
            }
            f.client.send(MessageKind::Ack, PacketFlags::parity(num_fragments % 2 == 1), 1, &[]).await;
        };

        assert!(num_fragments > 1);
        assert_eq!(ExchangeResponse::deser(MessageKind::Metadata, &reassembled).unwrap(), ExchangeResponse::Metadata(metadata));

        // a repeated final ack gets the final fragment again
        f.client.send(MessageKind::Ack, PacketFlags::parity((num_fragments - 1) % 2 == 1), 1, &[]).await;
        assert_eq!(f.client.recv().await, last);
    }

    #[tokio::test]
    async fn test_pool_exhausted() {
        let mut exchange_pool = MockExchangePool::new();
        exchange_pool.expect_try_rent()
            .with(always())
            .returning(|_| None);
        let f = start(|_| {}, Arc::new(exchange_pool), vote_handler(0)).await;

        f.client.send(MessageKind::Vote, SINGLE, 1, &vote_payload(42)).await;
        assert!(f.client.try_recv(Duration::from_millis(200)).await.is_none());
        assert_eq!(f.channel.num_exchanges().await, 0);
    }

    #[tokio::test]
    async fn test_invalid_datagrams_are_dropped() {
        let f = start(|_| {}, Arc::new(FixedExchangePool::new(4)), vote_handler(1)).await;

        // shorter than a header
        f.client.socket.send_to(&[1, 2, 3], f.client.server_addr).await.unwrap();
        // no exchange to continue
        f.client.send(MessageKind::Vote, PacketFlags::STREAM_END, 2, &vote_payload(1)).await;
        f.client.send(MessageKind::Vote, SINGLE | PacketFlags::ODD_SEQUENCE, 3, &vote_payload(1)).await;
        f.client.send(MessageKind::Ack, PacketFlags::empty(), 4, &[]).await;
        // responses are not for servers
        f.client.send(MessageKind::Response, SINGLE | PacketFlags::IS_RESPONSE, 5, &[1]).await;

        f.client.send(MessageKind::Vote, SINGLE, 6, &vote_payload(42)).await;
        let (header, _) = f.client.recv().await;
        assert_eq!(header.correlation_id, 6);
        assert!(f.client.try_recv(Duration::from_millis(50)).await.is_none());
    }

    #[tokio::test]
    async fn test_malformed_request_releases_exchange() {
        let exchange_pool = Arc::new(FixedExchangePool::new(4));
        let mut handler = MockRaftRpcHandler::new();
        handler.expect_receive_entries().never();
        let f = start(|_| {}, exchange_pool.clone(), handler).await;

        f.client.send(MessageKind::Heartbeat, SINGLE, 1, &[1, 2, 3]).await;
        assert!(f.client.try_recv(Duration::from_millis(100)).await.is_none());
        assert_eq!(f.channel.num_exchanges().await, 0);
        assert_eq!(exchange_pool.num_rented(MessageKind::Heartbeat), 0);
    }

    #[tokio::test]
    async fn test_idle_and_completed_exchanges_are_released() {
        let exchange_pool = Arc::new(FixedExchangePool::new(4));
        let f = start(|c| {
            c.receive_timeout = Duration::from_millis(100);
            c.response_linger = Duration::from_millis(100);
            c.retry_policy.sweep_interval = Duration::from_millis(10);
        }, exchange_pool.clone(), vote_handler(1)).await;

        let mut prefix = Vec::new();
        HeartbeatPrefix { term: 42, prev_log_index: 1, prev_log_term: 56, commit_index: 10 }.ser(&mut prefix);
        f.client.send(MessageKind::Heartbeat, PacketFlags::STREAM_START, 1, &prefix).await;
        f.client.recv().await;
        f.client.send(MessageKind::Vote, SINGLE, 2, &vote_payload(42)).await;
        f.client.recv().await;

        // the completed vote only keeps its response in the table
        assert_eq!(f.channel.num_exchanges().await, 2);
        assert_eq!(exchange_pool.num_rented(MessageKind::Heartbeat), 1);
        assert_eq!(exchange_pool.num_rented(MessageKind::Vote), 0);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(f.channel.num_exchanges().await, 0);
        assert_eq!(exchange_pool.num_rented(MessageKind::Heartbeat), 0);
        assert_eq!(exchange_pool.num_rented(MessageKind::Vote), 0);
    }

    #[tokio::test]
    async fn test_close() {
        let exchange_pool = Arc::new(FixedExchangePool::new(4));
        let f = start(|_| {}, exchange_pool.clone(), vote_handler(0)).await;

        let mut prefix = Vec::new();
        HeartbeatPrefix { term: 42, prev_log_index: 1, prev_log_term: 56, commit_index: 10 }.ser(&mut prefix);
        f.client.send(MessageKind::Heartbeat, PacketFlags::STREAM_START, 1, &prefix).await;
        f.client.recv().await;

        f.channel.close().await;
        assert_eq!(f.channel.num_exchanges().await, 0);
        assert_eq!(exchange_pool.num_rented(MessageKind::Heartbeat), 0);

        f.client.send(MessageKind::Vote, SINGLE, 2, &vote_payload(42)).await;
        assert!(f.client.try_recv(Duration::from_millis(100)).await.is_none());
    }
}
