//! Payload layouts of the exchange kinds. All numbers are big-endian.
//!
//! ```ascii
//! Vote request:          candidate term (i64), last log index (i64), last log term (i64)
//! Heartbeat request:     term (i64), prev log index (i64), prev log term (i64), commit index (i64)
//!                         in the first fragment, followed by log entries in all fragments
//! Resign request:        -
//! Metadata request:      -
//!
//! Vote / Heartbeat response: term (i64), flag (u8, 0 or 1)
//! Resign response:           flag (u8, 0 or 1)
//! Metadata response:         number of entries (varint), then (key, value) as varint-length
//!                             prefixed UTF-8 strings, ordered by key
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;
use anyhow::{anyhow, bail};
use bytes::{Buf, BufMut};
use bytes_varint::VarIntSupportMut;
use crate::handler::RaftResult;
use crate::packet_header::MessageKind;
use crate::util::buf::{put_string, try_get_len, try_get_string};

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct VoteRequest {
    pub term: i64,
    pub last_log_index: i64,
    pub last_log_term: i64,
}
impl VoteRequest {
    pub const SERIALIZED_LEN: usize = 3 * size_of::<i64>();

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_i64(self.term);
        buf.put_i64(self.last_log_index);
        buf.put_i64(self.last_log_term);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<VoteRequest> {
        Ok(VoteRequest {
            term: buf.try_get_i64()?,
            last_log_index: buf.try_get_i64()?,
            last_log_term: buf.try_get_i64()?,
        })
    }
}

/// The fixed part of a heartbeat request, preceding the log entries in its first fragment
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct HeartbeatPrefix {
    pub term: i64,
    pub prev_log_index: i64,
    pub prev_log_term: i64,
    pub commit_index: i64,
}
impl HeartbeatPrefix {
    pub const SERIALIZED_LEN: usize = 4 * size_of::<i64>();

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_i64(self.term);
        buf.put_i64(self.prev_log_index);
        buf.put_i64(self.prev_log_term);
        buf.put_i64(self.commit_index);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<HeartbeatPrefix> {
        Ok(HeartbeatPrefix {
            term: buf.try_get_i64()?,
            prev_log_index: buf.try_get_i64()?,
            prev_log_term: buf.try_get_i64()?,
            commit_index: buf.try_get_i64()?,
        })
    }
}

/// The response of an exchange, one variant per exchange kind
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ExchangeResponse {
    Vote(RaftResult<bool>),
    Heartbeat(RaftResult<bool>),
    Resign(bool),
    Metadata(Arc<BTreeMap<String, String>>),
}

impl ExchangeResponse {
    pub fn kind(&self) -> MessageKind {
        match self {
            ExchangeResponse::Vote(_) => MessageKind::Vote,
            ExchangeResponse::Heartbeat(_) => MessageKind::Heartbeat,
            ExchangeResponse::Resign(_) => MessageKind::Resign,
            ExchangeResponse::Metadata(_) => MessageKind::Metadata,
        }
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        match self {
            ExchangeResponse::Vote(result) | ExchangeResponse::Heartbeat(result) => {
                buf.put_i64(result.term);
                buf.put_u8(result.value.into());
            }
            ExchangeResponse::Resign(accepted) => buf.put_u8((*accepted).into()),
            ExchangeResponse::Metadata(map) => {
                buf.put_usize_varint(map.len());
                for (k, v) in map.iter() {
                    put_string(buf, k);
                    put_string(buf, v);
                }
            }
        }
    }

    /// parses a completely reassembled response for an exchange of the given kind
    pub fn deser(kind: MessageKind, mut buf: &[u8]) -> anyhow::Result<ExchangeResponse> {
        let result = match kind {
            MessageKind::Vote => ExchangeResponse::Vote(Self::deser_raft_result(&mut buf)?),
            MessageKind::Heartbeat => ExchangeResponse::Heartbeat(Self::deser_raft_result(&mut buf)?),
            MessageKind::Resign => ExchangeResponse::Resign(Self::deser_bool(&mut buf)?),
            MessageKind::Metadata => ExchangeResponse::Metadata(Arc::new(Self::deser_metadata(&mut buf)?)),
            MessageKind::Ack | MessageKind::Response => bail!("{:?} is not an exchange kind", kind),
        };

        if buf.has_remaining() {
            bail!("{} trailing bytes after {:?} response", buf.remaining(), kind);
        }
        Ok(result)
    }

    fn deser_raft_result(buf: &mut impl Buf) -> anyhow::Result<RaftResult<bool>> {
        let term = buf.try_get_i64()?;
        let value = Self::deser_bool(buf)?;
        Ok(RaftResult::new(term, value))
    }

    fn deser_bool(buf: &mut impl Buf) -> anyhow::Result<bool> {
        match buf.try_get_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            x => Err(anyhow!("invalid boolean value {}", x)),
        }
    }

    fn deser_metadata(buf: &mut impl Buf) -> anyhow::Result<BTreeMap<String, String>> {
        let num_entries = try_get_len(buf)?;
        let mut result = BTreeMap::new();
        for _ in 0..num_entries {
            let key = try_get_string(buf)?;
            let value = try_get_string(buf)?;
            result.insert(key, value);
        }
        Ok(result)
    }
}
