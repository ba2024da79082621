//! Fixed-capacity datagram buffers for reuse through the [super::buffer_pool::BufferPool].
//!
//! * backed by a pre-allocated buffer whose capacity never changes
//! * implement `BufMut` to fit into the `bytes` ecosystem
//! * the first [PacketHeader::SERIALIZED_LEN] bytes can be (re-)written after the payload, so
//!    the header can carry the payload's final length

use std::borrow::Borrow;
use std::fmt::{Debug, Formatter};
use bytes::buf::UninitSlice;
use crate::packet_header::PacketHeader;

/// A fixed-length dynamically allocated buffer
#[derive(Eq)]
pub struct FixedBuf {
    buf: Vec<u8>,
    len: usize,
}
impl FixedBuf {
    /// create a new FixedBuf instance with the given buffer capacity
    pub fn new(capacity: usize) -> FixedBuf {
        FixedBuf {
            // buffers are reused aggressively, so eager initialization is paid only once
            buf: vec![0; capacity],
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// make the entire underlying buffer available through as_mut(), e.g. for receiving
    pub fn maximize_len(&mut self) {
        self.len = self.capacity();
    }

    pub fn truncate(&mut self, len: usize) {
        assert!(len <= self.capacity());
        self.len = len;
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }

    /// Starts a datagram: the buffer is cleared and space for the packet header is reserved.
    ///  The payload is then appended through `BufMut`, and [FixedBuf::finish_datagram] fills
    ///  in the header.
    pub fn start_datagram(&mut self) {
        self.len = PacketHeader::SERIALIZED_LEN;
    }

    /// number of payload bytes written since [FixedBuf::start_datagram]
    pub fn payload_len(&self) -> usize {
        self.len - PacketHeader::SERIALIZED_LEN
    }

    pub fn payload(&self) -> &[u8] {
        &self.buf[PacketHeader::SERIALIZED_LEN..self.len]
    }

    pub fn finish_datagram(&mut self, header: &PacketHeader) {
        debug_assert_eq!(header.payload_length as usize, self.payload_len());
        header.ser(&mut &mut self.buf[..PacketHeader::SERIALIZED_LEN]);
    }

    /// This is a convenience function for test code. It derives the buffer's capacity from the
    ///  slice used for initialization, which is a shortcut not intended for production usage.
    #[cfg(test)]
    pub fn from_slice(len: usize, data: &[u8]) -> FixedBuf {
        let mut result = FixedBuf::new(len);
        bytes::BufMut::put_slice(&mut result, data);
        result
    }
}

impl PartialEq for FixedBuf {
    fn eq(&self, other: &Self) -> bool {
        self.as_ref().eq(other.as_ref())
    }
}

impl Debug for FixedBuf {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        self.as_ref().fmt(f)
    }
}

impl Borrow<[u8]> for FixedBuf {
    fn borrow(&self) -> &[u8] {
        self.as_ref()
    }
}

impl AsRef<[u8]> for FixedBuf {
    fn as_ref(&self) -> &[u8] {
        &self.buf[..self.len]
    }
}
impl AsMut<[u8]> for FixedBuf {
    fn as_mut(&mut self) -> &mut [u8] {
        &mut self.buf[..self.len]
    }
}

unsafe impl bytes::BufMut for FixedBuf {
    fn remaining_mut(&self) -> usize {
        self.buf.len() - self.len
    }

    unsafe fn advance_mut(&mut self, cnt: usize) {
        assert!(self.len + cnt <= self.capacity());
        self.len += cnt;
    }

    fn chunk_mut(&mut self) -> &mut UninitSlice {
        UninitSlice::new(&mut self.buf[self.len..])
    }
}
