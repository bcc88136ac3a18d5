// UDP transport: one socket, framed datagrams in and out.
//
// The transport never parses. Send failures are classified so the routing
// engine can pick the right synthetic SIP failure without inspecting errno
// itself.

use std::fmt;
use std::future::Future;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;

use tokio::net::UdpSocket;

use crate::error::ProxyError;

/// What went wrong on a datagram send, as far as routing cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendErrorKind {
    /// Host unreachable, network unreachable, no route: the peer is gone.
    Unreachable,
    /// Any other OS-level send failure.
    Other,
}

/// A classified send failure.
#[derive(Debug)]
pub struct SendFailure {
    pub kind: SendErrorKind,
    pub message: String,
}

impl fmt::Display for SendFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for SendFailure {}

/// Map an OS error to a send classification. errno values cover platforms
/// where the ErrorKind mapping is incomplete (65/113 EHOSTUNREACH,
/// 51/101 ENETUNREACH).
pub fn classify_io_error(err: &io::Error) -> SendErrorKind {
    match err.kind() {
        io::ErrorKind::HostUnreachable | io::ErrorKind::NetworkUnreachable => {
            SendErrorKind::Unreachable
        }
        _ => match err.raw_os_error() {
            Some(65) | Some(101) | Some(113) | Some(51) => SendErrorKind::Unreachable,
            _ => SendErrorKind::Other,
        },
    }
}

/// Datagram send seam. The engine only ever talks to this trait, so tests
/// substitute a recording or failing transport.
pub trait SipTransport: Send + Sync {
    fn send_to<'a>(
        &'a self,
        data: &'a [u8],
        addr: SocketAddr,
    ) -> Pin<Box<dyn Future<Output = Result<(), SendFailure>> + Send + 'a>>;
}

/// The real single-socket UDP transport.
pub struct UdpTransport {
    socket: UdpSocket,
}

impl UdpTransport {
    /// Bind the proxy socket. A failed bind is the only fatal startup error.
    pub async fn bind(addr: IpAddr, port: u16) -> Result<Self, ProxyError> {
        let socket = UdpSocket::bind(SocketAddr::new(addr, port)).await?;
        Ok(UdpTransport { socket })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ProxyError> {
        Ok(self.socket.local_addr()?)
    }

    /// Receive one datagram.
    pub async fn recv_from(&self) -> Result<(Vec<u8>, SocketAddr), ProxyError> {
        // Max UDP payload; stack buffer avoids a heap allocation per recv.
        let mut buf = [0u8; 65535];
        let (len, from) = self.socket.recv_from(&mut buf).await?;
        Ok((buf[..len].to_vec(), from))
    }
}

impl SipTransport for UdpTransport {
    fn send_to<'a>(
        &'a self,
        data: &'a [u8],
        addr: SocketAddr,
    ) -> Pin<Box<dyn Future<Output = Result<(), SendFailure>> + Send + 'a>> {
        Box::pin(async move {
            match self.socket.send_to(data, addr).await {
                Ok(_) => Ok(()),
                Err(e) => Err(SendFailure {
                    kind: classify_io_error(&e),
                    message: format!("send to {} failed: {}", addr, e),
                }),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[tokio::test]
    async fn bind_on_ephemeral_port() {
        let transport = UdpTransport::bind(IpAddr::V4(Ipv4Addr::LOCALHOST), 0)
            .await
            .expect("should bind");
        assert_eq!(transport.local_addr().unwrap().ip(), IpAddr::V4(Ipv4Addr::LOCALHOST));
    }

    #[tokio::test]
    async fn bind_conflict_errors() {
        let first = UdpTransport::bind(IpAddr::V4(Ipv4Addr::LOCALHOST), 0)
            .await
            .expect("first bind");
        let port = first.local_addr().unwrap().port();
        let second = UdpTransport::bind(IpAddr::V4(Ipv4Addr::LOCALHOST), port).await;
        assert!(second.is_err());
    }

    #[tokio::test]
    async fn send_and_recv_roundtrip() {
        let sender = UdpTransport::bind(IpAddr::V4(Ipv4Addr::LOCALHOST), 0)
            .await
            .expect("sender bind");
        let receiver = UdpTransport::bind(IpAddr::V4(Ipv4Addr::LOCALHOST), 0)
            .await
            .expect("receiver bind");
        let recv_addr = receiver.local_addr().unwrap();

        let payload = b"OPTIONS sip:proxy SIP/2.0\r\n\r\n";
        sender.send_to(payload, recv_addr).await.expect("send");

        let (data, from) = receiver.recv_from().await.expect("recv");
        assert_eq!(&data, payload);
        assert_eq!(from.ip(), IpAddr::V4(Ipv4Addr::LOCALHOST));
    }

    #[tokio::test]
    async fn send_empty_datagram() {
        let sender = UdpTransport::bind(IpAddr::V4(Ipv4Addr::LOCALHOST), 0)
            .await
            .expect("bind");
        let receiver = UdpTransport::bind(IpAddr::V4(Ipv4Addr::LOCALHOST), 0)
            .await
            .expect("bind");
        let recv_addr = receiver.local_addr().unwrap();

        sender.send_to(b"", recv_addr).await.expect("send empty");
        let (data, _) = receiver.recv_from().await.expect("recv");
        assert!(data.is_empty());
    }

    #[test]
    fn classify_unreachable_error_kinds() {
        let err = io::Error::new(io::ErrorKind::HostUnreachable, "no route to host");
        assert_eq!(classify_io_error(&err), SendErrorKind::Unreachable);
        let err = io::Error::new(io::ErrorKind::NetworkUnreachable, "network unreachable");
        assert_eq!(classify_io_error(&err), SendErrorKind::Unreachable);
    }

    #[test]
    fn classify_raw_errno_unreachable() {
        for errno in [65, 101, 113] {
            let err = io::Error::from_raw_os_error(errno);
            assert_eq!(classify_io_error(&err), SendErrorKind::Unreachable, "errno {}", errno);
        }
    }

    #[test]
    fn classify_other_errors() {
        let err = io::Error::new(io::ErrorKind::PermissionDenied, "denied");
        assert_eq!(classify_io_error(&err), SendErrorKind::Other);
    }

    #[test]
    fn send_failure_displays_message() {
        let failure = SendFailure {
            kind: SendErrorKind::Unreachable,
            message: "send to 10.0.0.3:5060 failed: no route".to_string(),
        };
        assert!(failure.to_string().contains("10.0.0.3:5060"));
    }
}
