use std::collections::VecDeque;
use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;
use bytes::BufMut;
use tokio_util::sync::CancellationToken;
use tracing::trace;
use crate::buffers::fixed_buffer::FixedBuf;
use crate::error::ExchangeError;
use crate::exchange::payload::{ExchangeResponse, HeartbeatPrefix, VoteRequest};
use crate::handler::RaftRpcHandler;
use crate::log_entry::{LogEntry, LogEntryProducer};
use crate::packet_header::{MessageKind, PacketFlags};

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ServerExchangeState {
    Created,
    ReceivingRequest,
    /// the request is complete and waits for (or is in) the handler
    Processing,
    SendingResponse,
    Completed,
    Failed,
}

/// The server side of an exchange. Instances are rented from an
///  [crate::exchange::pool::ExchangePool] for a specific kind, and are returned to it after
///  they completed or failed, so they are reused across many exchanges.
pub struct ServerExchange {
    kind: MessageKind,
    state: ServerExchangeState,
    handler_invoked: bool,

    /// raw request payload for the kinds that are not parsed incrementally
    request: Vec<u8>,
    heartbeat_prefix: Option<HeartbeatPrefix>,
    entries: VecDeque<LogEntry>,

    response: Vec<u8>,
    response_offset: usize,
    response_fragments_written: usize,
}

impl Debug for ServerExchange {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "ServerExchange{{{:?}:{:?}}}", self.kind, self.state)
    }
}

impl ServerExchange {
    pub fn new(kind: MessageKind) -> ServerExchange {
        assert!(kind.is_request(), "{:?} is not an exchange kind", kind);

        ServerExchange {
            kind,
            state: ServerExchangeState::Created,
            handler_invoked: false,
            request: Vec::new(),
            heartbeat_prefix: None,
            entries: VecDeque::new(),
            response: Vec::new(),
            response_offset: 0,
            response_fragments_written: 0,
        }
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn state(&self) -> ServerExchangeState {
        self.state
    }

    pub fn is_request_complete(&self) -> bool {
        self.state == ServerExchangeState::Processing
    }

    /// Marks the exchange as failed, e.g. because the client went silent. Completed exchanges
    ///  stay completed.
    pub fn abandon(&mut self) {
        if self.state != ServerExchangeState::Completed {
            self.state = ServerExchangeState::Failed;
        }
    }

    /// Consumes a request fragment's payload. Log entries are parsed as they arrive, so the
    ///  exchange does not need to hold the raw bytes of a heartbeat.
    pub fn consume_request_fragment(&mut self, payload: &[u8], is_final: bool) -> Result<(), ExchangeError> {
        match self.state {
            ServerExchangeState::Created => self.state = ServerExchangeState::ReceivingRequest,
            ServerExchangeState::ReceivingRequest => {}
            _ => return Err(ExchangeError::ProtocolViolation(format!("{:?} received a request fragment after the request was complete", self))),
        }

        if let Err(e) = self.parse_fragment(payload) {
            self.state = ServerExchangeState::Failed;
            return Err(ExchangeError::ProtocolViolation(format!("invalid {:?} request fragment: {}", self.kind, e)));
        }

        if is_final {
            self.state = ServerExchangeState::Processing;
        }
        Ok(())
    }

    fn parse_fragment(&mut self, mut payload: &[u8]) -> anyhow::Result<()> {
        if self.kind != MessageKind::Heartbeat {
            self.request.put_slice(payload);
            return Ok(());
        }

        if self.heartbeat_prefix.is_none() {
            self.heartbeat_prefix = Some(HeartbeatPrefix::deser(&mut payload)?);
        }
        while !payload.is_empty() {
            self.entries.push_back(LogEntry::deser(&mut payload)?);
        }
        Ok(())
    }

    /// Calls the handler function for this exchange's kind. This is done at most once per
    ///  rental, after the request was received completely.
    pub async fn invoke_handler(&mut self, handler: &dyn RaftRpcHandler, sender: SocketAddr, cancel: CancellationToken) -> Result<ExchangeResponse, ExchangeError> {
        if self.state != ServerExchangeState::Processing || self.handler_invoked {
            return Err(ExchangeError::IllegalState(format!("handler can not be invoked for {:?}", self)));
        }
        self.handler_invoked = true;

        let response = match self.kind {
            MessageKind::Vote => {
                let parsed = VoteRequest::deser(&mut self.request.as_slice());
                let req = parsed.map_err(|e| self.violation(e))?;
                ExchangeResponse::Vote(handler.receive_vote(sender, req.term, req.last_log_index, req.last_log_term, cancel).await)
            }
            MessageKind::Heartbeat => {
                let prefix = self.heartbeat_prefix
                    .ok_or_else(|| self.violation("heartbeat without header"))?;
                let entries = std::mem::take(&mut self.entries);
                trace!("passing {} log entries to the handler", entries.remaining_count());
                ExchangeResponse::Heartbeat(handler.receive_entries(sender, prefix.term, Box::new(entries), prefix.prev_log_index, prefix.prev_log_term, prefix.commit_index, cancel).await)
            }
            MessageKind::Resign => ExchangeResponse::Resign(handler.resign(cancel).await),
            MessageKind::Metadata => ExchangeResponse::Metadata(handler.metadata()),
            MessageKind::Ack | MessageKind::Response => unreachable!("server exchanges are created for request kinds only"),
        };
        trace!("handler returned {:?}", response);
        Ok(response)
    }

    fn violation(&mut self, e: impl std::fmt::Display) -> ExchangeError {
        self.state = ServerExchangeState::Failed;
        ExchangeError::ProtocolViolation(format!("invalid {:?} request: {}", self.kind, e))
    }

    /// Serializes the handler's result as this exchange's response payload
    pub fn create_response(&mut self, response: &ExchangeResponse) -> Result<(), ExchangeError> {
        if self.state != ServerExchangeState::Processing || !self.handler_invoked {
            return Err(ExchangeError::IllegalState(format!("can not create a response for {:?}", self)));
        }
        if response.kind() != self.kind {
            return Err(ExchangeError::IllegalState(format!("{:?} response for {:?}", response.kind(), self)));
        }

        self.response.clear();
        response.ser(&mut self.response);
        self.response_offset = 0;
        self.response_fragments_written = 0;
        self.state = ServerExchangeState::SendingResponse;
        Ok(())
    }

    /// Writes the next response fragment's payload into `buf` (which is started as a datagram),
    ///  returning the stream flags for its header. Response payloads are split at arbitrary byte
    ///  boundaries; the client concatenates them before decoding.
    pub fn write_response_fragment(&mut self, buf: &mut FixedBuf, max_payload: usize) -> Result<PacketFlags, ExchangeError> {
        if self.state != ServerExchangeState::SendingResponse {
            return Err(ExchangeError::IllegalState(format!("no response fragment to write for {:?}", self)));
        }

        buf.start_datagram();
        let end = self.response.len().min(self.response_offset + max_payload);
        buf.put_slice(&self.response[self.response_offset..end]);

        let mut flags = PacketFlags::IS_RESPONSE;
        if self.response_fragments_written == 0 {
            flags |= PacketFlags::STREAM_START;
        }
        self.response_fragments_written += 1;
        self.response_offset = end;

        if self.response_offset == self.response.len() {
            flags |= PacketFlags::STREAM_END;
            self.state = ServerExchangeState::Completed;
        }
        trace!("wrote response fragment #{} with {} bytes: {:?}", self.response_fragments_written, buf.payload_len(), flags);
        Ok(flags)
    }

    /// Prepares the exchange for reuse. Exchanges that are neither completed nor failed are
    ///  still referenced by a channel, and must not be reset.
    pub fn reset(&mut self) -> Result<(), ExchangeError> {
        if !matches!(self.state, ServerExchangeState::Completed | ServerExchangeState::Failed) {
            return Err(ExchangeError::IllegalState(format!("reset of active {:?}", self)));
        }

        self.state = ServerExchangeState::Created;
        self.handler_invoked = false;
        self.request.clear();
        self.heartbeat_prefix = None;
        self.entries.clear();
        self.response.clear();
        self.response_offset = 0;
        self.response_fragments_written = 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use mockall::predicate::eq;
    use rstest::rstest;
    use crate::handler::{MockRaftRpcHandler, RaftResult};
    use crate::log_entry::drain_entries;

    fn sender() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 9001))
    }

    fn vote_payload(term: i64, last_log_index: i64, last_log_term: i64) -> Vec<u8> {
        let mut buf = Vec::new();
        VoteRequest { term, last_log_index, last_log_term }.ser(&mut buf);
        buf
    }

    #[tokio::test]
    async fn test_vote() {
        let mut handler = MockRaftRpcHandler::new();
        handler.expect_receive_vote()
            .with(eq(sender()), eq(42), eq(1), eq(56), mockall::predicate::always())
            .once()
            .return_const(RaftResult::new(43, true));

        let mut exchange = ServerExchange::new(MessageKind::Vote);
        exchange.consume_request_fragment(&vote_payload(42, 1, 56), true).unwrap();
        assert_eq!(exchange.state(), ServerExchangeState::Processing);

        let response = exchange.invoke_handler(&handler, sender(), CancellationToken::new()).await.unwrap();
        assert_eq!(response, ExchangeResponse::Vote(RaftResult::new(43, true)));

        exchange.create_response(&response).unwrap();
        let mut buf = FixedBuf::new(100);
        let flags = exchange.write_response_fragment(&mut buf, 88).unwrap();
        assert_eq!(flags, PacketFlags::IS_RESPONSE | PacketFlags::STREAM_START | PacketFlags::STREAM_END);
        assert_eq!(buf.payload(), &[0,0,0,0,0,0,0,43, 1]);
        assert_eq!(exchange.state(), ServerExchangeState::Completed);
    }

    #[tokio::test]
    async fn test_handler_is_invoked_once() {
        let mut handler = MockRaftRpcHandler::new();
        handler.expect_resign()
            .once()
            .return_const(true);

        let mut exchange = ServerExchange::new(MessageKind::Resign);
        exchange.consume_request_fragment(&[], true).unwrap();
        exchange.invoke_handler(&handler, sender(), CancellationToken::new()).await.unwrap();
        assert!(matches!(exchange.invoke_handler(&handler, sender(), CancellationToken::new()).await, Err(ExchangeError::IllegalState(_))));
    }

    #[tokio::test]
    async fn test_heartbeat_from_fragments() {
        let prefix = HeartbeatPrefix { term: 42, prev_log_index: 1, prev_log_term: 56, commit_index: 10 };
        let entries = (0..5)
            .map(|i| LogEntry::new(i, vec![i as u8; 10]))
            .collect::<Vec<_>>();

        let mut first = Vec::new();
        prefix.ser(&mut first);
        entries[0].ser(&mut first);
        let mut second = Vec::new();
        for e in &entries[1..] {
            e.ser(&mut second);
        }

        let expected = entries.clone();
        let mut handler = MockRaftRpcHandler::new();
        handler.expect_receive_entries()
            .once()
            .returning(move |_, term, mut entries, prev_log_index, prev_log_term, commit_index, _| {
                assert_eq!((term, prev_log_index, prev_log_term, commit_index), (42, 1, 56, 10));
                assert_eq!(entries.remaining_count(), 5);
                assert_eq!(drain_entries(entries.as_mut()), expected);
                RaftResult::new(43, true)
            });

        let mut exchange = ServerExchange::new(MessageKind::Heartbeat);
        exchange.consume_request_fragment(&first, false).unwrap();
        assert_eq!(exchange.state(), ServerExchangeState::ReceivingRequest);
        exchange.consume_request_fragment(&second, true).unwrap();

        let response = exchange.invoke_handler(&handler, sender(), CancellationToken::new()).await.unwrap();
        assert_eq!(response, ExchangeResponse::Heartbeat(RaftResult::new(43, true)));
    }

    #[test]
    fn test_fragment_after_final() {
        let mut exchange = ServerExchange::new(MessageKind::Resign);
        exchange.consume_request_fragment(&[], true).unwrap();
        assert!(matches!(exchange.consume_request_fragment(&[], true), Err(ExchangeError::ProtocolViolation(_))));
    }

    #[rstest]
    #[case::truncated_prefix(vec![0, 0, 0])]
    #[case::truncated_entry(vec![0; HeartbeatPrefix::SERIALIZED_LEN + 5])]
    fn test_invalid_heartbeat(#[case] payload: Vec<u8>) {
        let mut exchange = ServerExchange::new(MessageKind::Heartbeat);
        assert!(matches!(exchange.consume_request_fragment(&payload, true), Err(ExchangeError::ProtocolViolation(_))));
        assert_eq!(exchange.state(), ServerExchangeState::Failed);
    }

    #[tokio::test]
    async fn test_invalid_vote() {
        let handler = MockRaftRpcHandler::new();
        let mut exchange = ServerExchange::new(MessageKind::Vote);
        exchange.consume_request_fragment(&[1, 2, 3], true).unwrap();
        assert!(matches!(exchange.invoke_handler(&handler, sender(), CancellationToken::new()).await, Err(ExchangeError::ProtocolViolation(_))));
        assert_eq!(exchange.state(), ServerExchangeState::Failed);
        exchange.reset().unwrap();
    }

    #[tokio::test]
    async fn test_response_fragments() {
        let metadata: BTreeMap<String, String> = (0..20)
            .map(|i| (format!("key-{}", i), format!("value-{}", i)))
            .collect();
        let metadata = Arc::new(metadata);
        let mut handler = MockRaftRpcHandler::new();
        let m = metadata.clone();
        handler.expect_metadata()
            .returning(move || m.clone());

        let mut exchange = ServerExchange::new(MessageKind::Metadata);
        exchange.consume_request_fragment(&[], true).unwrap();
        let response = exchange.invoke_handler(&handler, sender(), CancellationToken::new()).await.unwrap();
        exchange.create_response(&response).unwrap();

        let mut reassembled = Vec::new();
        let mut buf = FixedBuf::new(100);
        let mut num_fragments = 0;
        loop {
            let flags = exchange.write_response_fragment(&mut buf, 50).unwrap();
            assert!(buf.payload_len() <= 50);
            assert_eq!(flags.contains(PacketFlags::STREAM_START), num_fragments == 0);
            reassembled.extend_from_slice(buf.payload());
            num_fragments += 1;
            if flags.contains(PacketFlags::STREAM_END) {
                break;
            }
            assert_eq!(exchange.state(), ServerExchangeState::SendingResponse);
        }

        assert!(num_fragments > 1);
        assert_eq!(ExchangeResponse::deser(MessageKind::Metadata, &reassembled).unwrap(), ExchangeResponse::Metadata(metadata));
        assert!(exchange.write_response_fragment(&mut buf, 50).is_err());
    }

    #[rstest]
    #[case::created(ServerExchange::new(MessageKind::Vote))]
    #[case::receiving({
        let mut e = ServerExchange::new(MessageKind::Heartbeat);
        e.consume_request_fragment(&[0; HeartbeatPrefix::SERIALIZED_LEN], false).unwrap();
        e
    })]
    #[case::processing({
        let mut e = ServerExchange::new(MessageKind::Resign);
        e.consume_request_fragment(&[], true).unwrap();
        e
    })]
    fn test_reset_of_active_exchange(#[case] mut exchange: ServerExchange) {
        assert!(matches!(exchange.reset(), Err(ExchangeError::IllegalState(_))));
    }

    #[test]
    fn test_reset_after_abandon() {
        let mut exchange = ServerExchange::new(MessageKind::Heartbeat);
        exchange.consume_request_fragment(&[0; HeartbeatPrefix::SERIALIZED_LEN], false).unwrap();
        exchange.abandon();
        exchange.reset().unwrap();
        assert_eq!(exchange.state(), ServerExchangeState::Created);
        assert!(!exchange.is_request_complete());
    }
}
