//! SOCKS5 wire format (RFC 1928), the subset a CONNECT-only proxy needs

use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const SOCKS5_VERSION: u8 = 0x05;

/// Authentication methods offered during method negotiation
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    NoAuth = 0x00,
    NoAcceptable = 0xff,
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Connect = 0x01,
    Bind = 0x02,
    UdpAssociate = 0x03,
}

impl Command {
    fn from_u8(code: u8) -> Option<Self> {
        match code {
            0x01 => Some(Command::Connect),
            0x02 => Some(Command::Bind),
            0x03 => Some(Command::UdpAssociate),
            _ => None,
        }
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressType {
    Ipv4 = 0x01,
    DomainName = 0x03,
    Ipv6 = 0x04,
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    Succeeded = 0x00,
    GeneralFailure = 0x01,
    NetworkUnreachable = 0x03,
    HostUnreachable = 0x04,
    ConnectionRefused = 0x05,
    TtlExpired = 0x06,
    CommandNotSupported = 0x07,
    AddressTypeNotSupported = 0x08,
}

impl Reply {
    #[cfg(test)]
    pub fn from_u8(code: u8) -> Option<Self> {
        let reply = match code {
            0x00 => Reply::Succeeded,
            0x01 => Reply::GeneralFailure,
            0x03 => Reply::NetworkUnreachable,
            0x04 => Reply::HostUnreachable,
            0x05 => Reply::ConnectionRefused,
            0x06 => Reply::TtlExpired,
            0x07 => Reply::CommandNotSupported,
            0x08 => Reply::AddressTypeNotSupported,
            _ => return None,
        };
        Some(reply)
    }

    /// Reply code for a failed outbound dial
    pub fn for_dial_error(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionRefused => Reply::ConnectionRefused,
            io::ErrorKind::NetworkUnreachable => Reply::NetworkUnreachable,
            io::ErrorKind::TimedOut => Reply::TtlExpired,
            _ => Reply::HostUnreachable,
        }
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Reply::Succeeded => "succeeded",
            Reply::GeneralFailure => "general failure",
            Reply::NetworkUnreachable => "network unreachable",
            Reply::HostUnreachable => "host unreachable",
            Reply::ConnectionRefused => "connection refused",
            Reply::TtlExpired => "TTL expired",
            Reply::CommandNotSupported => "command not supported",
            Reply::AddressTypeNotSupported => "address type not supported",
        };
        f.write_str(text)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{0}")]
    Io(#[from] io::Error),
    #[error("unsupported SOCKS version {0:#x}")]
    UnsupportedVersion(u8),
    #[error("unsupported command {0:#x}")]
    UnsupportedCommand(u8),
    #[error("address type {0:#x} not supported")]
    AddressTypeNotSupported(u8),
    #[error("domain name is not valid UTF-8")]
    InvalidDomainName,
}

impl Error {
    /// Reply sent to the client before the connection is dropped
    pub fn as_reply(&self) -> Reply {
        match self {
            Error::UnsupportedCommand(..) => Reply::CommandNotSupported,
            Error::AddressTypeNotSupported(..) => Reply::AddressTypeNotSupported,
            _ => Reply::GeneralFailure,
        }
    }
}

/// Destination of a request, as the client sent it
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    Socket(SocketAddr),
    Domain(String, u16),
}

impl Address {
    pub async fn read_from<R: AsyncRead + Unpin>(r: &mut R) -> Result<Self, Error> {
        let atyp = r.read_u8().await?;
        match atyp {
            t if t == AddressType::Ipv4 as u8 => {
                let ip = Ipv4Addr::from(r.read_u32().await?);
                let port = r.read_u16().await?;
                Ok(Address::Socket(SocketAddr::new(IpAddr::V4(ip), port)))
            }
            t if t == AddressType::Ipv6 as u8 => {
                let ip = Ipv6Addr::from(r.read_u128().await?);
                let port = r.read_u16().await?;
                Ok(Address::Socket(SocketAddr::new(IpAddr::V6(ip), port)))
            }
            t if t == AddressType::DomainName as u8 => {
                let len = r.read_u8().await? as usize;
                let mut raw = vec![0u8; len];
                r.read_exact(&mut raw).await?;
                let port = r.read_u16().await?;
                let domain = String::from_utf8(raw).map_err(|_| Error::InvalidDomainName)?;
                Ok(Address::Domain(domain, port))
            }
            other => Err(Error::AddressTypeNotSupported(other)),
        }
    }

    pub fn write_to_buf<B: BufMut>(&self, buf: &mut B) {
        match self {
            Address::Socket(SocketAddr::V4(addr)) => {
                buf.put_u8(AddressType::Ipv4 as u8);
                buf.put_slice(&addr.ip().octets());
                buf.put_u16(addr.port());
            }
            Address::Socket(SocketAddr::V6(addr)) => {
                buf.put_u8(AddressType::Ipv6 as u8);
                buf.put_slice(&addr.ip().octets());
                buf.put_u16(addr.port());
            }
            Address::Domain(domain, port) => {
                // Names longer than 255 bytes cannot be encoded, clip them
                let raw = &domain.as_bytes()[..domain.len().min(u8::MAX as usize)];
                buf.put_u8(AddressType::DomainName as u8);
                buf.put_u8(raw.len() as u8);
                buf.put_slice(raw);
                buf.put_u16(*port);
            }
        }
    }

    pub fn serialized_len(&self) -> usize {
        match self {
            Address::Socket(SocketAddr::V4(..)) => 1 + 4 + 2,
            Address::Socket(SocketAddr::V6(..)) => 1 + 16 + 2,
            Address::Domain(domain, _) => 1 + 1 + domain.len().min(u8::MAX as usize) + 2,
        }
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        Address::Socket(addr)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Socket(addr) => write!(f, "{addr}"),
            Address::Domain(domain, port) => write!(f, "{domain}:{port}"),
        }
    }
}

/// Method negotiation, first message from the client
///
/// ```plain
/// +----+----------+----------+
/// |VER | NMETHODS | METHODS  |
/// +----+----------+----------+
/// | 1  |    1     | 1 to 255 |
/// +----+----------+----------+
/// ```
#[derive(Debug, Clone)]
pub struct HandshakeRequest {
    pub methods: Vec<u8>,
}

impl HandshakeRequest {
    pub async fn read_from<R: AsyncRead + Unpin>(r: &mut R) -> Result<Self, Error> {
        let ver = r.read_u8().await?;
        if ver != SOCKS5_VERSION {
            return Err(Error::UnsupportedVersion(ver));
        }
        let count = r.read_u8().await? as usize;
        let mut methods = vec![0u8; count];
        r.read_exact(&mut methods).await?;
        Ok(Self { methods })
    }

    pub fn offers(&self, method: AuthMethod) -> bool {
        self.methods.contains(&(method as u8))
    }

    #[cfg(test)]
    pub async fn write_to<W: AsyncWrite + Unpin>(&self, w: &mut W) -> io::Result<()> {
        let mut buf = BytesMut::with_capacity(2 + self.methods.len());
        buf.put_u8(SOCKS5_VERSION);
        buf.put_u8(self.methods.len() as u8);
        buf.put_slice(&self.methods);
        w.write_all(&buf).await
    }
}

#[derive(Debug, Clone, Copy)]
pub struct HandshakeResponse {
    pub method: u8,
}

impl HandshakeResponse {
    pub fn new(method: AuthMethod) -> Self {
        Self { method: method as u8 }
    }

    #[cfg(test)]
    pub async fn read_from<R: AsyncRead + Unpin>(r: &mut R) -> Result<Self, Error> {
        let ver = r.read_u8().await?;
        if ver != SOCKS5_VERSION {
            return Err(Error::UnsupportedVersion(ver));
        }
        Ok(Self { method: r.read_u8().await? })
    }

    pub async fn write_to<W: AsyncWrite + Unpin>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(&[SOCKS5_VERSION, self.method]).await
    }
}

/// Request following a successful negotiation
///
/// ```plain
/// +----+-----+-------+------+----------+----------+
/// |VER | CMD |  RSV  | ATYP | DST.ADDR | DST.PORT |
/// +----+-----+-------+------+----------+----------+
/// | 1  |  1  | X'00' |  1   | Variable |    2     |
/// +----+-----+-------+------+----------+----------+
/// ```
#[derive(Debug, Clone)]
pub struct TcpRequestHeader {
    pub command: Command,
    pub address: Address,
}

impl TcpRequestHeader {
    #[cfg(test)]
    pub fn new(command: Command, address: Address) -> Self {
        Self { command, address }
    }

    pub async fn read_from<R: AsyncRead + Unpin>(r: &mut R) -> Result<Self, Error> {
        let mut head = [0u8; 3];
        r.read_exact(&mut head).await?;
        let [ver, cmd, _rsv] = head;
        if ver != SOCKS5_VERSION {
            return Err(Error::UnsupportedVersion(ver));
        }
        let command = Command::from_u8(cmd).ok_or(Error::UnsupportedCommand(cmd))?;
        let address = Address::read_from(r).await?;
        Ok(Self { command, address })
    }

    #[cfg(test)]
    pub async fn write_to<W: AsyncWrite + Unpin>(&self, w: &mut W) -> io::Result<()> {
        let mut buf = BytesMut::with_capacity(3 + self.address.serialized_len());
        buf.put_slice(&[SOCKS5_VERSION, self.command as u8, 0x00]);
        self.address.write_to_buf(&mut buf);
        w.write_all(&buf).await
    }
}

/// Server answer to a request; same layout with REP in place of CMD
#[derive(Debug, Clone)]
pub struct TcpResponseHeader {
    pub reply: Reply,
    pub address: Address,
}

impl TcpResponseHeader {
    pub fn new(reply: Reply, address: Address) -> Self {
        Self { reply, address }
    }

    /// Failure reply; the bound address is meaningless so it is all zeros
    pub fn failure(reply: Reply) -> Self {
        Self::new(reply, Address::Socket(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)))
    }

    #[cfg(test)]
    pub async fn read_from<R: AsyncRead + Unpin>(r: &mut R) -> Result<Self, Error> {
        let mut head = [0u8; 3];
        r.read_exact(&mut head).await?;
        let [ver, rep, _rsv] = head;
        if ver != SOCKS5_VERSION {
            return Err(Error::UnsupportedVersion(ver));
        }
        let reply = Reply::from_u8(rep).unwrap_or(Reply::GeneralFailure);
        let address = Address::read_from(r).await?;
        Ok(Self { reply, address })
    }

    pub async fn write_to<W: AsyncWrite + Unpin>(&self, w: &mut W) -> io::Result<()> {
        let mut buf = BytesMut::with_capacity(3 + self.address.serialized_len());
        buf.put_slice(&[SOCKS5_VERSION, self.reply as u8, 0x00]);
        self.address.write_to_buf(&mut buf);
        w.write_all(&buf).await
    }
}
