use std::time::Duration;
use anyhow::bail;
use crate::packet_header::PacketHeader;

pub struct UdpConfig {
    /// The number of datagram channels of a client or server. Each channel has its own receive
    ///  loop, so this is the primary knob for parallelism. On a client, it also bounds the
    ///  number of sockets; exchanges are spread across channels round-robin.
    pub channel_count: usize,

    /// The maximum size of a datagram (header plus payload) that this node sends. Payloads
    ///  exceeding `max_datagram_size - PacketHeader::SERIALIZED_LEN` are fragmented.
    ///
    /// Receive buffers are always sized for [UdpConfig::MAX_DATAGRAM_SIZE], so peers with
    ///  different settings interoperate.
    pub max_datagram_size: usize,

    /// client side: the time an exchange may take from being enqueued to its final response
    ///  fragment before it fails with a timeout
    pub response_timeout: Duration,

    /// server side: the time an exchange may stay idle (waiting for the client's next fragment
    ///  or acknowledgement) before it is abandoned and returned to the pool
    pub receive_timeout: Duration,

    /// server side: the time a completed exchange is kept after its final response fragment
    ///  was sent, so that a retransmitted request gets the response again instead of being
    ///  processed a second time
    pub response_linger: Duration,

    pub retry_policy: RetryPolicy,

    /// This is the number of buffers that will be pooled at a given time - buffers in excess of this
    ///  number are discarded when they are returned.
    pub buffer_pool_size: usize,

    /// server side: the maximum number of exchanges per message kind that can be in progress
    ///  at the same time. Requests in excess of this are dropped.
    pub exchange_pool_capacity: usize,
}

impl UdpConfig {
    /// the maximum UDP payload over IPv4
    pub const MAX_DATAGRAM_SIZE: usize = 65507;
    /// the smallest datagram size that can carry every non-fragmentable payload
    pub const MIN_DATAGRAM_SIZE: usize = 300;

    pub fn new() -> UdpConfig {
        UdpConfig {
            channel_count: 2,
            max_datagram_size: Self::MAX_DATAGRAM_SIZE,
            response_timeout: Duration::from_secs(10),
            receive_timeout: Duration::from_secs(10),
            response_linger: Duration::from_secs(1),
            retry_policy: RetryPolicy::default(),
            buffer_pool_size: 1024,
            exchange_pool_capacity: 1024,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.channel_count == 0 {
            bail!("at least one channel is required");
        }
        if self.max_datagram_size < Self::MIN_DATAGRAM_SIZE {
            bail!("maximum datagram size {} is below the minimum of {}", self.max_datagram_size, Self::MIN_DATAGRAM_SIZE);
        }
        if self.max_datagram_size > Self::MAX_DATAGRAM_SIZE {
            bail!("maximum datagram size {} exceeds the maximum of {}", self.max_datagram_size, Self::MAX_DATAGRAM_SIZE);
        }
        if self.exchange_pool_capacity == 0 {
            bail!("exchange pool capacity must be positive");
        }
        if self.retry_policy.sweep_interval.is_zero() {
            bail!("sweep interval must be positive");
        }
        Ok(())
    }

    pub fn max_payload_len(&self) -> usize {
        self.max_datagram_size - PacketHeader::SERIALIZED_LEN
    }
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Client-side retransmission. An exchange's last datagram is sent again if it was not answered
///  within `retransmit_after`, at most `max_retransmissions` times over the exchange's lifetime
///  to bound amplification under loss.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub retransmit_after: Duration,
    pub max_retransmissions: u32,
    /// interval of the periodic check for retransmissions and expired deadlines
    pub sweep_interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            retransmit_after: Duration::from_millis(200),
            max_retransmissions: 1,
            sweep_interval: Duration::from_millis(50),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_default_is_valid() {
        assert!(UdpConfig::new().validate().is_ok());
        assert_eq!(UdpConfig::new().max_payload_len(), 65507 - 12);
    }

    #[rstest]
    #[case::no_channels(|c: &mut UdpConfig| c.channel_count = 0)]
    #[case::too_small(|c: &mut UdpConfig| c.max_datagram_size = 299)]
    #[case::too_big(|c: &mut UdpConfig| c.max_datagram_size = 65508)]
    #[case::no_pool(|c: &mut UdpConfig| c.exchange_pool_capacity = 0)]
    #[case::no_sweep(|c: &mut UdpConfig| c.retry_policy.sweep_interval = Duration::ZERO)]
    fn test_invalid(#[case] modify: fn(&mut UdpConfig)) {
        let mut config = UdpConfig::new();
        modify(&mut config);
        assert!(config.validate().is_err());
    }

    #[rstest]
    #[case::min(UdpConfig::MIN_DATAGRAM_SIZE)]
    #[case::max(UdpConfig::MAX_DATAGRAM_SIZE)]
    fn test_boundaries(#[case] size: usize) {
        let mut config = UdpConfig::new();
        config.max_datagram_size = size;
        assert!(config.validate().is_ok());
    }
}
