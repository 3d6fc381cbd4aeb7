//! In-process stand-ins for the router DNS server, the network and the
//! resolver, shared by the unit tests.

use std::collections::{HashMap, HashSet};
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::rdata::{A, AAAA};
use hickory_proto::rr::{Name, RData, Record, RecordType};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};

use crate::dialer::{Dialer, TokioDialer};
use crate::dns::{NameResolver, ResolveError};

/// What the fake DNS server knows
#[derive(Debug, Clone, Default)]
pub struct Zone {
    records: HashMap<String, Vec<IpAddr>>,
    nxdomain: HashSet<String>,
    servfail: HashSet<String>,
    servfail_for: HashSet<(String, RecordType)>,
    truncate_udp: bool,
    silent: bool,
    noise_first: bool,
}

impl Zone {
    pub fn with_records(mut self, name: &str, ips: &[&str]) -> Self {
        let ips = ips.iter().map(|ip| ip.parse().unwrap()).collect();
        self.records.insert(name.to_owned(), ips);
        self
    }

    pub fn with_nxdomain(mut self, name: &str) -> Self {
        self.nxdomain.insert(name.to_owned());
        self
    }

    pub fn with_servfail(mut self, name: &str) -> Self {
        self.servfail.insert(name.to_owned());
        self
    }

    /// SERVFAIL for one record type only, like routers that choke on AAAA
    pub fn with_servfail_for(mut self, name: &str, record_type: RecordType) -> Self {
        self.servfail_for.insert((name.to_owned(), record_type));
        self
    }

    /// Before each UDP answer, send an unparsable datagram and an answer to
    /// a different question carrying the same id
    pub fn noise_first(mut self) -> Self {
        self.noise_first = true;
        self
    }

    /// Every UDP answer comes back empty with TC set
    pub fn truncate_udp(mut self) -> Self {
        self.truncate_udp = true;
        self
    }

    /// Never answer at all
    pub fn silent(mut self) -> Self {
        self.silent = true;
        self
    }

    fn answer(&self, request: &Message, over_udp: bool) -> Message {
        let mut response = Message::new();
        response.set_id(request.id());
        response.set_message_type(MessageType::Response);
        response.set_op_code(OpCode::Query);
        response.set_recursion_desired(request.recursion_desired());
        response.set_recursion_available(true);
        response.add_queries(request.queries().to_vec());

        let Some(query) = request.queries().first() else {
            response.set_response_code(ResponseCode::FormErr);
            return response;
        };
        let name = query.name().to_utf8();
        let name = name.trim_end_matches('.');

        if self.servfail.contains(name) || self.servfail_for.contains(&(name.to_owned(), query.query_type())) {
            response.set_response_code(ResponseCode::ServFail);
            return response;
        }
        if self.nxdomain.contains(name) {
            response.set_response_code(ResponseCode::NXDomain);
            return response;
        }
        if over_udp && self.truncate_udp {
            response.set_truncated(true);
            return response;
        }

        for ip in self.records.get(name).into_iter().flatten() {
            let rdata = match (ip, query.query_type()) {
                (IpAddr::V4(v4), RecordType::A) => RData::A(A(*v4)),
                (IpAddr::V6(v6), RecordType::AAAA) => RData::AAAA(AAAA(*v6)),
                _ => continue,
            };
            response.add_answer(Record::from_rdata(query.name().clone(), 60, rdata));
        }
        response
    }
}

/// DNS server on ephemeral loopback ports, UDP and TCP
pub struct FakeDnsServer {
    udp_addr: SocketAddr,
    tcp_addr: SocketAddr,
    queries: Arc<Mutex<Vec<(String, RecordType)>>>,
}

impl FakeDnsServer {
    pub async fn start(zone: Zone) -> Self {
        let udp = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let tcp = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let udp_addr = udp.local_addr().unwrap();
        let tcp_addr = tcp.local_addr().unwrap();
        let queries = Arc::new(Mutex::new(Vec::new()));
        let zone = Arc::new(zone);

        {
            let zone = zone.clone();
            let queries = queries.clone();
            tokio::spawn(async move {
                let mut buf = vec![0u8; 4096];
                loop {
                    let Ok((n, peer)) = udp.recv_from(&mut buf).await else { break };
                    let Ok(request) = Message::from_vec(&buf[..n]) else { continue };
                    record_query(&queries, &request);
                    if zone.silent {
                        continue;
                    }
                    if zone.noise_first {
                        let _ = udp.send_to(b"\x00\x01not dns", peer).await;
                        let mut decoy = Message::new();
                        decoy.set_id(request.id());
                        decoy.add_query(Query::query(Name::from_ascii("decoy.invalid.").unwrap(), RecordType::A));
                        let decoy = zone.answer(&decoy, true).to_vec().unwrap();
                        let _ = udp.send_to(&decoy, peer).await;
                    }
                    let response = zone.answer(&request, true).to_vec().unwrap();
                    let _ = udp.send_to(&response, peer).await;
                }
            });
        }

        {
            let queries = queries.clone();
            tokio::spawn(async move {
                while let Ok((mut stream, _)) = tcp.accept().await {
                    let zone = zone.clone();
                    let queries = queries.clone();
                    tokio::spawn(async move {
                        let Ok(size) = stream.read_u16().await else { return };
                        let mut raw = vec![0u8; size as usize];
                        if stream.read_exact(&mut raw).await.is_err() {
                            return;
                        }
                        let Ok(request) = Message::from_vec(&raw) else { return };
                        record_query(&queries, &request);
                        if zone.silent {
                            return;
                        }
                        let response = zone.answer(&request, false).to_vec().unwrap();
                        let _ = stream.write_u16(response.len() as u16).await;
                        let _ = stream.write_all(&response).await;
                    });
                }
            });
        }

        Self {
            udp_addr,
            tcp_addr,
            queries,
        }
    }

    pub fn udp_addr(&self) -> SocketAddr {
        self.udp_addr
    }

    pub fn tcp_addr(&self) -> SocketAddr {
        self.tcp_addr
    }

    pub fn queries(&self) -> Vec<(String, RecordType)> {
        self.queries.lock().unwrap().clone()
    }
}

fn record_query(queries: &Mutex<Vec<(String, RecordType)>>, request: &Message) {
    if let Some(query) = request.queries().first() {
        queries
            .lock()
            .unwrap()
            .push((query.name().to_utf8(), query.query_type()));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialed {
    Tcp(SocketAddr),
    Udp(SocketAddr),
}

impl Dialed {
    pub fn addr(&self) -> SocketAddr {
        match *self {
            Dialed::Tcp(addr) | Dialed::Udp(addr) => addr,
        }
    }
}

/// Records every address it is asked to dial, then connects to the routed
/// replacement (or the address itself when there is no route).
#[derive(Default)]
pub struct RecordingDialer {
    tcp_routes: HashMap<SocketAddr, SocketAddr>,
    udp_routes: HashMap<SocketAddr, SocketAddr>,
    refuse_all: bool,
    dialed: Mutex<Vec<Dialed>>,
}

impl RecordingDialer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route_tcp(mut self, from: SocketAddr, to: SocketAddr) -> Self {
        self.tcp_routes.insert(from, to);
        self
    }

    pub fn route_udp(mut self, from: SocketAddr, to: SocketAddr) -> Self {
        self.udp_routes.insert(from, to);
        self
    }

    pub fn refuse_all(mut self) -> Self {
        self.refuse_all = true;
        self
    }

    pub fn dialed(&self) -> Vec<Dialed> {
        self.dialed.lock().unwrap().clone()
    }

    fn refused(&self) -> io::Result<()> {
        if self.refuse_all {
            return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "connection refused"));
        }
        Ok(())
    }
}

#[async_trait]
impl Dialer for RecordingDialer {
    async fn connect_tcp(&self, addr: SocketAddr) -> io::Result<TcpStream> {
        self.dialed.lock().unwrap().push(Dialed::Tcp(addr));
        self.refused()?;
        let target = self.tcp_routes.get(&addr).copied().unwrap_or(addr);
        TokioDialer.connect_tcp(target).await
    }

    async fn connect_udp(&self, addr: SocketAddr) -> io::Result<UdpSocket> {
        self.dialed.lock().unwrap().push(Dialed::Udp(addr));
        self.refused()?;
        let target = self.udp_routes.get(&addr).copied().unwrap_or(addr);
        let socket = UdpSocket::bind("127.0.0.1:0").await?;
        socket.connect(target).await?;
        Ok(socket)
    }
}

/// Counts calls to the wrapped resolver
pub struct CountingResolver<R> {
    inner: R,
    calls: AtomicUsize,
}

impl<R> CountingResolver<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<R: NameResolver> NameResolver for CountingResolver<R> {
    async fn resolve(&self, name: &str) -> Result<Option<IpAddr>, ResolveError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.resolve(name).await
    }
}

/// TCP echo server on an ephemeral loopback port
pub async fn echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut r, mut w) = stream.split();
                let _ = tokio::io::copy(&mut r, &mut w).await;
            });
        }
    });
    addr
}

/// Reads each request to EOF, then writes `reply` and closes
pub async fn reply_after_eof_server(reply: &'static [u8]) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut request = Vec::new();
                if stream.read_to_end(&mut request).await.is_ok() {
                    let _ = stream.write_all(reply).await;
                }
            });
        }
    });
    addr
}

/// Answers every name with the same result
pub struct StaticResolver(pub Option<IpAddr>);

#[async_trait]
impl NameResolver for StaticResolver {
    async fn resolve(&self, _name: &str) -> Result<Option<IpAddr>, ResolveError> {
        Ok(self.0)
    }
}
