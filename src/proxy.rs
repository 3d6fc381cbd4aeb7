//! SOCKS5 proxy whose hostname lookups all go through the router-pinned
//! resolver.

use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, info, trace, warn};

use crate::async_tunnel::{tunnel_connect, TunnelTotals};
use crate::config::ProxyConfig;
use crate::dns::ResolveError;
use crate::socks5::{
    Address, AuthMethod, Command, HandshakeRequest, HandshakeResponse, Reply, TcpRequestHeader,
    TcpResponseHeader,
};
use crate::tunnel_stats::ConnectionStats;

const LISTEN_BACKLOG: i32 = 1024;

/// Where a connection is in its life; errors are reported against it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Accepted,
    Handshaking,
    Resolving,
    Dialing,
    Relaying,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Accepted => "accepted",
            ConnectionState::Handshaking => "handshaking",
            ConnectionState::Resolving => "resolving",
            ConnectionState::Dialing => "dialing",
            ConnectionState::Relaying => "relaying",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("{0}")]
    Io(#[from] io::Error),
    #[error("{0}")]
    Protocol(#[from] crate::socks5::Error),
    #[error("client offered no acceptable authentication method")]
    NoAcceptableAuth,
    #[error("handshake timed out")]
    HandshakeTimeout,
    #[error("{0:?} is not supported")]
    UnsupportedCommand(Command),
    #[error("resolving {name}: {source}")]
    Resolve { name: String, source: ResolveError },
    #[error("{0} has no address")]
    NoAddress(String),
    #[error("connecting to {target}: {source}")]
    Dial { target: SocketAddr, source: io::Error },
}

impl ConnectionError {
    pub fn state(&self) -> ConnectionState {
        match self {
            ConnectionError::Io(..)
            | ConnectionError::Protocol(..)
            | ConnectionError::NoAcceptableAuth
            | ConnectionError::HandshakeTimeout
            | ConnectionError::UnsupportedCommand(..) => ConnectionState::Handshaking,
            ConnectionError::Resolve { .. } | ConnectionError::NoAddress(..) => ConnectionState::Resolving,
            ConnectionError::Dial { .. } => ConnectionState::Dialing,
        }
    }
}

struct Shared {
    config: ProxyConfig,
    stats: Arc<ConnectionStats>,
}

/// A bound, not yet serving, SOCKS5 proxy
pub struct ProxyServer {
    listener: TcpListener,
    shared: Arc<Shared>,
}

impl ProxyServer {
    /// Bind the listening socket right away so the caller sees
    /// `AddrInUse` and friends before anything else starts.
    pub fn bind(config: ProxyConfig) -> io::Result<Self> {
        let listener = bind_listener(config.listen_addr)?;
        info!("SOCKS5 proxy listening on {}", listener.local_addr()?);

        Ok(Self {
            listener,
            shared: Arc::new(Shared {
                config,
                stats: ConnectionStats::new(),
            }),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn stats(&self) -> Arc<ConnectionStats> {
        self.shared.stats.clone()
    }

    /// Serve on a background task for the rest of the process
    pub fn spawn(self) -> io::Result<ProxyHandle> {
        let local_addr = self.local_addr()?;
        let stats = self.stats();
        let task = tokio::spawn(self.accept_connections());
        Ok(ProxyHandle {
            local_addr,
            stats,
            task,
        })
    }

    /// Accept until the listener fails for good; each client gets its own task
    pub async fn accept_connections(self) -> io::Result<()> {
        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(err) if is_transient_accept_error(&err) => {
                    warn!("SOCKS5 accept failed, continuing: {}", err);
                    continue;
                }
                Err(err) => {
                    error!("SOCKS5 accept failed: {}", err);
                    return Err(err);
                }
            };

            trace!("{} {}", peer, ConnectionState::Accepted);
            let shared = self.shared.clone();
            tokio::spawn(async move {
                shared.serve(stream, peer).await;
            });
        }
    }
}

/// Running proxy
pub struct ProxyHandle {
    local_addr: SocketAddr,
    stats: Arc<ConnectionStats>,
    task: JoinHandle<io::Result<()>>,
}

impl ProxyHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stats(&self) -> Arc<ConnectionStats> {
        self.stats.clone()
    }

    /// Resolves only if the accept loop dies
    pub async fn wait(self) -> io::Result<()> {
        match self.task.await {
            Ok(result) => result,
            Err(err) => Err(io::Error::new(io::ErrorKind::Other, err)),
        }
    }
}

impl Shared {
    async fn serve(&self, mut stream: TcpStream, peer: SocketAddr) {
        self.stats.connection_opened();
        let stats = self.stats.clone();
        let _closed = scopeguard::guard((), move |_| {
            stats.connection_closed();
            stats.log_stats();
        });

        match self.handle(&mut stream, peer).await {
            Ok(totals) => {
                self.stats.record_relay(totals);
                debug!(
                    "{} {}, {} bytes out, {} bytes in",
                    peer,
                    ConnectionState::Closed,
                    totals.bytes_out,
                    totals.bytes_in
                );
            }
            Err(err) => {
                self.stats.connection_failed();
                debug!("{} {} while {}: {}", peer, ConnectionState::Closed, err.state(), err);
            }
        }
    }

    async fn handle(&self, stream: &mut TcpStream, peer: SocketAddr) -> Result<TunnelTotals, ConnectionError> {
        trace!("{} {}", peer, ConnectionState::Handshaking);
        let request = match time::timeout(self.config.handshake_timeout, handshake(stream)).await {
            Ok(request) => request?,
            Err(..) => return Err(ConnectionError::HandshakeTimeout),
        };

        let target = match request.address {
            Address::Socket(addr) => addr,
            Address::Domain(name, port) => {
                trace!("{} {} {}", peer, ConnectionState::Resolving, name);
                match self.resolve(name).await {
                    Ok(ip) => SocketAddr::new(ip, port),
                    Err(err) => {
                        reply_failure(stream, Reply::HostUnreachable).await;
                        return Err(err);
                    }
                }
            }
        };

        trace!("{} {} {}", peer, ConnectionState::Dialing, target);
        let outbound = match self.dial(target).await {
            Ok(outbound) => outbound,
            Err(source) => {
                reply_failure(stream, Reply::for_dial_error(&source)).await;
                return Err(ConnectionError::Dial { target, source });
            }
        };

        let bound = outbound
            .local_addr()
            .unwrap_or_else(|_| SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0));
        TcpResponseHeader::new(Reply::Succeeded, bound.into())
            .write_to(stream)
            .await?;

        trace!("{} {} {}", peer, ConnectionState::Relaying, target);
        Ok(tunnel_connect(stream, outbound).await)
    }

    /// One lookup through the configured resolver, no retries
    async fn resolve(&self, name: String) -> Result<IpAddr, ConnectionError> {
        let timeout = self.config.resolve_timeout;
        match time::timeout(timeout, self.config.resolver.resolve(&name)).await {
            Ok(Ok(Some(ip))) => Ok(ip),
            Ok(Ok(None)) => Err(ConnectionError::NoAddress(name)),
            Ok(Err(source)) => Err(ConnectionError::Resolve { name, source }),
            Err(..) => {
                let source = ResolveError::Timeout {
                    name: name.clone(),
                    elapsed: timeout,
                };
                Err(ConnectionError::Resolve { name, source })
            }
        }
    }

    async fn dial(&self, target: SocketAddr) -> io::Result<TcpStream> {
        match time::timeout(self.config.connect_timeout, self.config.dialer.connect_tcp(target)).await {
            Ok(result) => result,
            Err(..) => Err(io::Error::new(io::ErrorKind::TimedOut, "connect timed out")),
        }
    }
}

/// Method negotiation plus the request; only NO AUTH and CONNECT get through
async fn handshake(stream: &mut TcpStream) -> Result<TcpRequestHeader, ConnectionError> {
    let greeting = HandshakeRequest::read_from(stream).await?;
    if !greeting.offers(AuthMethod::NoAuth) {
        HandshakeResponse::new(AuthMethod::NoAcceptable).write_to(stream).await?;
        return Err(ConnectionError::NoAcceptableAuth);
    }
    HandshakeResponse::new(AuthMethod::NoAuth).write_to(stream).await?;

    let request = match TcpRequestHeader::read_from(stream).await {
        Ok(request) => request,
        Err(err) => {
            reply_failure(stream, err.as_reply()).await;
            return Err(err.into());
        }
    };

    if request.command != Command::Connect {
        reply_failure(stream, Reply::CommandNotSupported).await;
        return Err(ConnectionError::UnsupportedCommand(request.command));
    }
    Ok(request)
}

async fn reply_failure(stream: &mut TcpStream, reply: Reply) {
    if let Err(err) = TcpResponseHeader::failure(reply).write_to(stream).await {
        trace!("failed to send '{}' reply: {}", reply, err);
    }
}

fn bind_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    // Lets a restart reuse the port while old connections sit in TIME_WAIT.
    // A second live listener on the same address still fails.
    #[cfg(unix)]
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    TcpListener::from_std(socket.into())
}

fn is_transient_accept_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted | io::ErrorKind::ConnectionReset | io::ErrorKind::Interrupted
    )
}
