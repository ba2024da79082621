use std::fmt::{Debug, Formatter};
use bytes::BufMut;
use tracing::trace;
use crate::buffers::fixed_buffer::FixedBuf;
use crate::error::ExchangeError;
use crate::exchange::payload::{ExchangeResponse, HeartbeatPrefix, VoteRequest};
use crate::log_entry::{LogEntry, LogEntryProducer};
use crate::packet_header::{MessageKind, PacketFlags, PacketHeader};

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ClientExchangeState {
    Created,
    AwaitingSend,
    AwaitingResponse,
    Completed,
    Failed,
    Cancelled,
}

enum ExchangeRequest {
    Vote(VoteRequest),
    Heartbeat {
        prefix: HeartbeatPrefix,
        entries: Box<dyn LogEntryProducer>,
        /// an entry that was pulled from the producer but did not fit into the previous fragment
        pending: Option<LogEntry>,
    },
    Resign,
    Metadata,
}

/// What the channel should do after a datagram from the server was consumed
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ResponseStep {
    /// the server acknowledged a request fragment and waits for the next one
    SendNextRequestFragment,
    /// a non-final response fragment arrived, the server waits for an acknowledgement
    Acknowledge,
    Completed(ExchangeResponse),
}

/// The client side of a single request / response interaction. It is created by application
///  code, then handed to a client which owns it until it completes.
///
/// The exchange itself does no I/O: the channel asks it to write request fragments and feeds
///  it the server's datagrams.
pub struct ClientExchange {
    request: ExchangeRequest,
    state: ClientExchangeState,
    request_fragments_written: usize,
    request_complete: bool,
    response: Vec<u8>,
}

impl Debug for ClientExchange {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "ClientExchange{{{:?}:{:?}, {} fragments sent}}", self.kind(), self.state, self.request_fragments_written)
    }
}

impl ClientExchange {
    fn new(request: ExchangeRequest) -> ClientExchange {
        ClientExchange {
            request,
            state: ClientExchangeState::Created,
            request_fragments_written: 0,
            request_complete: false,
            response: Vec::new(),
        }
    }

    pub fn vote(term: i64, last_log_index: i64, last_log_term: i64) -> ClientExchange {
        Self::new(ExchangeRequest::Vote(VoteRequest { term, last_log_index, last_log_term }))
    }

    /// Entries are pulled from `entries` lazily while request fragments are written, and are
    ///  delivered to the server's handler in the same order.
    pub fn heartbeat(term: i64, prev_log_index: i64, prev_log_term: i64, commit_index: i64, entries: impl LogEntryProducer) -> ClientExchange {
        Self::new(ExchangeRequest::Heartbeat {
            prefix: HeartbeatPrefix { term, prev_log_index, prev_log_term, commit_index },
            entries: Box::new(entries),
            pending: None,
        })
    }

    pub fn resign() -> ClientExchange {
        Self::new(ExchangeRequest::Resign)
    }

    pub fn metadata() -> ClientExchange {
        Self::new(ExchangeRequest::Metadata)
    }

    pub fn kind(&self) -> MessageKind {
        match &self.request {
            ExchangeRequest::Vote(_) => MessageKind::Vote,
            ExchangeRequest::Heartbeat { .. } => MessageKind::Heartbeat,
            ExchangeRequest::Resign => MessageKind::Resign,
            ExchangeRequest::Metadata => MessageKind::Metadata,
        }
    }

    pub fn state(&self) -> ClientExchangeState {
        self.state
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.state, ClientExchangeState::Completed | ClientExchangeState::Failed | ClientExchangeState::Cancelled)
    }

    pub fn is_request_complete(&self) -> bool {
        self.request_complete
    }

    /// called by the channel when it takes ownership
    pub fn on_enqueued(&mut self) -> Result<(), ExchangeError> {
        if self.state != ClientExchangeState::Created {
            return Err(ExchangeError::IllegalState(format!("{:?} was enqueued before", self)));
        }
        self.state = ClientExchangeState::AwaitingSend;
        Ok(())
    }

    pub fn fail(&mut self) {
        self.state = ClientExchangeState::Failed;
    }

    pub fn cancel(&mut self) {
        self.state = ClientExchangeState::Cancelled;
    }

    /// Writes the next request fragment's payload into `buf` (which is started as a datagram),
    ///  returning the stream flags for its header. At most `max_payload` bytes are written.
    pub fn write_request_fragment(&mut self, buf: &mut FixedBuf, max_payload: usize) -> Result<PacketFlags, ExchangeError> {
        if self.request_complete || self.is_terminal() {
            return Err(ExchangeError::IllegalState(format!("no request fragment left to write for {:?}", self)));
        }

        buf.start_datagram();
        let is_first = self.request_fragments_written == 0;

        match &mut self.request {
            ExchangeRequest::Vote(req) => {
                req.ser(buf);
                self.request_complete = true;
            }
            ExchangeRequest::Resign | ExchangeRequest::Metadata => {
                self.request_complete = true;
            }
            ExchangeRequest::Heartbeat { prefix, entries, pending } => {
                if is_first {
                    prefix.ser(buf);
                }
                loop {
                    let entry = match pending.take().or_else(|| entries.next_entry()) {
                        Some(entry) => entry,
                        None => {
                            self.request_complete = true;
                            break;
                        }
                    };

                    let len = entry.serialized_len();
                    if len > max_payload {
                        self.state = ClientExchangeState::Failed;
                        return Err(ExchangeError::EntryTooLarge { len, max_payload });
                    }
                    if len > max_payload - buf.payload_len() {
                        *pending = Some(entry);
                        break;
                    }
                    entry.ser(buf);
                }
            }
        }

        self.request_fragments_written += 1;
        self.state = ClientExchangeState::AwaitingResponse;

        let mut flags = PacketFlags::empty();
        if is_first {
            flags |= PacketFlags::STREAM_START;
        }
        if self.request_complete {
            flags |= PacketFlags::STREAM_END;
        }
        trace!("wrote request fragment #{} with {} bytes: {:?}", self.request_fragments_written, buf.payload_len(), flags);
        Ok(flags)
    }

    /// Consumes a datagram the server sent for this exchange.
    ///
    /// A response that does not decode, or that contradicts the request, fails the exchange:
    ///  callers can tell this from a merely unexpected datagram by checking the state afterwards.
    pub fn consume_response_fragment(&mut self, header: &PacketHeader, payload: &[u8]) -> Result<ResponseStep, ExchangeError> {
        if self.state != ClientExchangeState::AwaitingResponse {
            return Err(ExchangeError::ProtocolViolation(format!("{:?} received {:?} but is not awaiting a response", self, header)));
        }

        match header.kind {
            MessageKind::Ack => {
                if self.request_complete {
                    return Err(ExchangeError::ProtocolViolation(format!("{:?} was acknowledged after the final request fragment", self)));
                }
                Ok(ResponseStep::SendNextRequestFragment)
            }
            MessageKind::Response => {
                if !self.request_complete {
                    return Err(ExchangeError::ProtocolViolation(format!("{:?} received a response before the request was complete", self)));
                }
                if header.is_stream_start() && !self.response.is_empty() {
                    return Err(ExchangeError::ProtocolViolation(format!("{:?} received a second response start", self)));
                }
                self.response.put_slice(payload);

                if !header.is_stream_end() {
                    return Ok(ResponseStep::Acknowledge);
                }

                match self.decode_response() {
                    Ok(response) => {
                        self.state = ClientExchangeState::Completed;
                        self.response = Vec::new();
                        Ok(ResponseStep::Completed(response))
                    }
                    Err(e) => {
                        self.state = ClientExchangeState::Failed;
                        Err(e)
                    }
                }
            }
            kind => Err(ExchangeError::ProtocolViolation(format!("{:?} received a datagram of kind {:?}", self, kind))),
        }
    }

    fn decode_response(&self) -> Result<ExchangeResponse, ExchangeError> {
        let response = ExchangeResponse::deser(self.kind(), &self.response)
            .map_err(|e| ExchangeError::ProtocolViolation(format!("invalid {:?} response: {}", self.kind(), e)))?;

        if let (ExchangeRequest::Vote(req), ExchangeResponse::Vote(result)) = (&self.request, &response) {
            if result.value && result.term < req.term {
                return Err(ExchangeError::ProtocolViolation(format!("vote granted for term {} which is below the candidate's term {}", result.term, req.term)));
            }
        }
        Ok(response)
    }
}
