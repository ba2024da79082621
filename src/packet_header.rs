use bitflags::bitflags;
use bytes::{Buf, BufMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::fmt::{Debug, Formatter};
use crate::error::ExchangeError;

#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
pub enum MessageKind {
    Vote = 1,
    Heartbeat = 2,
    Resign = 3,
    Metadata = 4,
    /// answer to a non-final fragment, asking the peer for the next one
    Ack = 5,
    /// fragment of a response payload
    Response = 6,
}
impl MessageKind {
    /// The kinds that start an exchange, i.e. for which a server rents an exchange
    pub const REQUEST_KINDS: [MessageKind; 4] = [MessageKind::Vote, MessageKind::Heartbeat, MessageKind::Resign, MessageKind::Metadata];

    pub fn is_request(&self) -> bool {
        Self::REQUEST_KINDS.contains(self)
    }
}

bitflags! {
    #[derive(Debug, PartialEq, Eq, Copy, Clone, Hash)]
    pub struct PacketFlags: u8 {
        /// first fragment of a request or response stream
        const STREAM_START = 0b0000_0001;
        /// last fragment of a request or response stream
        const STREAM_END = 0b0000_0010;
        /// sent by the server side of an exchange
        const IS_RESPONSE = 0b0000_0100;
        /// alternating bit: set for a client's odd-numbered datagrams in an exchange, and echoed
        ///  by the server's answer
        const ODD_SEQUENCE = 0b0000_1000;
    }
}
impl PacketFlags {
    pub fn parity(odd: bool) -> PacketFlags {
        if odd {
            PacketFlags::ODD_SEQUENCE
        }
        else {
            PacketFlags::empty()
        }
    }
}

/// Every datagram starts with this header. Its size and layout are the same for all message
///  kinds, so a receiver can dispatch before it knows anything about the payload.
///
/// ```ascii
///  0: kind (u8)
///  1: flags (u8)
///  2: correlation id (u64 BE)
/// 10: payload length (u16 BE)
/// ```
#[derive(Clone, Copy, Eq, PartialEq)]
pub struct PacketHeader {
    pub kind: MessageKind,
    pub flags: PacketFlags,
    pub correlation_id: u64,
    pub payload_length: u16,
}
impl Debug for PacketHeader {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let direction = if self.flags.contains(PacketFlags::IS_RESPONSE) { "<" } else { ">" };
        let start = if self.flags.contains(PacketFlags::STREAM_START) { "S" } else { "" };
        let end = if self.flags.contains(PacketFlags::STREAM_END) { "E" } else { "" };
        let parity = if self.flags.contains(PacketFlags::ODD_SEQUENCE) { 1 } else { 0 };
        write!(f, "PCKT{{{}{:?}#{}[{}{}/{}]:{}}}", direction, self.kind, self.correlation_id, start, end, parity, self.payload_length)
    }
}

impl PacketHeader {
    pub const SERIALIZED_LEN: usize =
        size_of::<u8>()      // kind
        + size_of::<u8>()    // flags
        + size_of::<u64>()   // correlation id
        + size_of::<u16>();  // payload length

    pub fn new(kind: MessageKind, flags: PacketFlags, correlation_id: u64, payload_length: u16) -> PacketHeader {
        PacketHeader {
            kind,
            flags,
            correlation_id,
            payload_length,
        }
    }

    pub fn is_response(&self) -> bool {
        self.flags.contains(PacketFlags::IS_RESPONSE)
    }

    pub fn is_stream_start(&self) -> bool {
        self.flags.contains(PacketFlags::STREAM_START)
    }

    pub fn is_stream_end(&self) -> bool {
        self.flags.contains(PacketFlags::STREAM_END)
    }

    pub fn is_odd(&self) -> bool {
        self.flags.contains(PacketFlags::ODD_SEQUENCE)
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.kind.into());
        buf.put_u8(self.flags.bits());
        buf.put_u64(self.correlation_id);
        buf.put_u16(self.payload_length);
    }

    pub fn encode(&self) -> [u8; Self::SERIALIZED_LEN] {
        let mut result = [0u8; Self::SERIALIZED_LEN];
        self.ser(&mut result.as_mut_slice());
        result
    }

    /// Parses the header at the start of a received datagram, checking that the payload it
    ///  announces is actually there.
    pub fn decode(datagram: &[u8]) -> Result<PacketHeader, ExchangeError> {
        if datagram.len() < Self::SERIALIZED_LEN {
            return Err(ExchangeError::MalformedHeader(format!("datagram of {} bytes is shorter than the header", datagram.len())));
        }

        let mut buf = datagram;
        let raw_kind = buf.get_u8();
        let kind = MessageKind::try_from_primitive(raw_kind)
            .map_err(|_| ExchangeError::MalformedHeader(format!("unknown message kind {}", raw_kind)))?;
        let flags = PacketFlags::from_bits_truncate(buf.get_u8());
        let correlation_id = buf.get_u64();
        let payload_length = buf.get_u16();

        if payload_length as usize > buf.remaining() {
            return Err(ExchangeError::MalformedHeader(format!("payload length {} exceeds the {} bytes received", payload_length, buf.remaining())));
        }

        Ok(PacketHeader {
            kind,
            flags,
            correlation_id,
            payload_length,
        })
    }

    /// the payload part of a datagram whose header was parsed successfully
    pub fn payload<'a>(&self, datagram: &'a [u8]) -> &'a [u8] {
        &datagram[Self::SERIALIZED_LEN..Self::SERIALIZED_LEN + self.payload_length as usize]
    }
}
