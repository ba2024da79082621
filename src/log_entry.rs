use bytes::{Buf, BufMut, Bytes};
use std::collections::VecDeque;
use anyhow::bail;
use crate::util::safe_converter::PrecheckedCast;

/// A replicated log entry as it travels inside heartbeat exchanges. The content is opaque to
///  the transport.
///
/// ```ascii
///  0: term (i64)
///  8: timestamp (i64), millis since epoch
/// 16: flags (u8) - bit 0: snapshot
/// 17: content length (u32)
/// 21: content
/// ```
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct LogEntry {
    pub term: i64,
    pub timestamp: i64,
    pub is_snapshot: bool,
    pub content: Bytes,
}

impl LogEntry {
    const FLAG_SNAPSHOT: u8 = 1;
    pub const SERIALIZED_OVERHEAD: usize = size_of::<i64>() + size_of::<i64>() + size_of::<u8>() + size_of::<u32>();

    pub fn new(term: i64, content: impl Into<Bytes>) -> LogEntry {
        LogEntry {
            term,
            timestamp: 0,
            is_snapshot: false,
            content: content.into(),
        }
    }

    pub fn serialized_len(&self) -> usize {
        Self::SERIALIZED_OVERHEAD + self.content.len()
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_i64(self.term);
        buf.put_i64(self.timestamp);
        buf.put_u8(if self.is_snapshot { Self::FLAG_SNAPSHOT } else { 0 });
        buf.put_u32(self.content.len().prechecked_cast());
        buf.put_slice(&self.content);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<LogEntry> {
        let term = buf.try_get_i64()?;
        let timestamp = buf.try_get_i64()?;
        let flags = buf.try_get_u8()?;
        let len = buf.try_get_u32()? as usize;
        if len > buf.remaining() {
            bail!("log entry content of {} bytes exceeds the remaining {} bytes", len, buf.remaining());
        }
        let content = buf.copy_to_bytes(len);

        Ok(LogEntry {
            term,
            timestamp,
            is_snapshot: flags & Self::FLAG_SNAPSHOT != 0,
            content,
        })
    }
}

/// The source of log entries for a heartbeat exchange. Entries are pulled lazily as datagrams
///  are filled, so a producer can stream entries from storage.
pub trait LogEntryProducer: Send + 'static {
    /// the number of entries not yet handed out
    fn remaining_count(&self) -> usize;

    fn next_entry(&mut self) -> Option<LogEntry>;
}

/// pulls all remaining entries out of a producer
#[cfg(test)]
pub fn drain_entries(producer: &mut dyn LogEntryProducer) -> Vec<LogEntry> {
    let mut result = Vec::with_capacity(producer.remaining_count());
    while let Some(entry) = producer.next_entry() {
        result.push(entry);
    }
    result
}

impl LogEntryProducer for VecDeque<LogEntry> {
    fn remaining_count(&self) -> usize {
        self.len()
    }

    fn next_entry(&mut self) -> Option<LogEntry> {
        self.pop_front()
    }
}

impl LogEntryProducer for std::vec::IntoIter<LogEntry> {
    fn remaining_count(&self) -> usize {
        self.len()
    }

    fn next_entry(&mut self) -> Option<LogEntry> {
        self.next()
    }
}
