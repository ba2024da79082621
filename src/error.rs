use std::io;
use crate::packet_header::MessageKind;

/// Problems with a single datagram or exchange that the transport absorbs locally: they are
///  logged, the offending datagram is dropped, and the channel loop carries on.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExchangeError {
    #[error("malformed header: {0}")]
    MalformedHeader(String),
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("exchange pool exhausted for {0:?}")]
    PoolExhausted(MessageKind),
    #[error("illegal exchange state: {0}")]
    IllegalState(String),
    #[error("log entry of {len} bytes does not fit into a datagram payload of {max_payload} bytes")]
    EntryTooLarge {
        len: usize,
        max_payload: usize,
    },
}

/// The outcome of an exchange as seen by the code that enqueued it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RpcError {
    #[error("exchange timed out")]
    Timeout,
    #[error("exchange was cancelled")]
    Cancelled,
    #[error("transport error ({kind:?}): {message}")]
    Transport {
        kind: io::ErrorKind,
        message: String,
    },
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("channel is closed")]
    ChannelClosed,
}

impl From<&io::Error> for RpcError {
    fn from(e: &io::Error) -> Self {
        RpcError::Transport {
            kind: e.kind(),
            message: e.to_string(),
        }
    }
}

impl From<ExchangeError> for RpcError {
    fn from(e: ExchangeError) -> Self {
        RpcError::ProtocolViolation(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::refused(io::ErrorKind::ConnectionRefused)]
    #[case::reset(io::ErrorKind::ConnectionReset)]
    #[case::other(io::ErrorKind::Other)]
    fn test_from_io_error(#[case] kind: io::ErrorKind) {
        let e = io::Error::new(kind, "boom");
        match RpcError::from(&e) {
            RpcError::Transport { kind: actual, message } => {
                assert_eq!(actual, kind);
                assert_eq!(message, "boom");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_from_exchange_error() {
        let e = ExchangeError::EntryTooLarge { len: 500, max_payload: 288 };
        assert_eq!(
            RpcError::from(e),
            RpcError::ProtocolViolation("log entry of 500 bytes does not fit into a datagram payload of 288 bytes".to_string()),
        );
    }
}
