use std::io;
use std::net::SocketAddr;
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tokio::net::UdpSocket;
use tracing::trace;

/// This is an abstraction for sending a datagram on a UDP socket, introduced to facilitate
///  mocking the I/O part away for testing
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SendSocket: Send + Sync + 'static {
    async fn send_datagram(&self, to: SocketAddr, datagram: &[u8]) -> io::Result<()>;
}

#[async_trait]
impl SendSocket for UdpSocket {
    async fn send_datagram(&self, to: SocketAddr, datagram: &[u8]) -> io::Result<()> {
        trace!("UDP socket: sending {} bytes to {:?}", datagram.len(), to);
        self.send_to(datagram, to).await?;
        Ok(())
    }
}

/// Connection refused / reset are reported asynchronously through ICMP, and concern a single
///  datagram sent earlier rather than the socket.
pub fn is_transient(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::ConnectionRefused | io::ErrorKind::ConnectionReset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::refused(io::ErrorKind::ConnectionRefused, true)]
    #[case::reset(io::ErrorKind::ConnectionReset, true)]
    #[case::other(io::ErrorKind::Other, false)]
    #[case::permission(io::ErrorKind::PermissionDenied, false)]
    fn test_is_transient(#[case] kind: io::ErrorKind, #[case] expected: bool) {
        assert_eq!(is_transient(&io::Error::new(kind, "x")), expected);
    }

    #[tokio::test]
    async fn test_send_datagram() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        sender.send_datagram(receiver.local_addr().unwrap(), &[1, 2, 3]).await.unwrap();

        let mut buf = [0u8; 10];
        let (n, from) = receiver.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], &[1, 2, 3]);
        assert_eq!(from, sender.local_addr().unwrap());
    }
}
