use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

use async_trait::async_trait;
use tokio::net::{TcpStream, UdpSocket};

/// Opens outbound sockets. Shared read-only between the resolver and every
/// proxy connection, so implementations must not keep per-connection state.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn connect_tcp(&self, addr: SocketAddr) -> io::Result<TcpStream>;
    async fn connect_udp(&self, addr: SocketAddr) -> io::Result<UdpSocket>;
}

/// Plain tokio sockets
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioDialer;

#[async_trait]
impl Dialer for TokioDialer {
    async fn connect_tcp(&self, addr: SocketAddr) -> io::Result<TcpStream> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    async fn connect_udp(&self, addr: SocketAddr) -> io::Result<UdpSocket> {
        let local: SocketAddr = match addr {
            SocketAddr::V4(..) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            SocketAddr::V6(..) => (Ipv6Addr::UNSPECIFIED, 0).into(),
        };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(addr).await?;
        Ok(socket)
    }
}
