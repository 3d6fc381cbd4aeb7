//! Router-pinned DNS resolver
//!
//! Every socket this resolver opens is dialed to the one upstream it was
//! built with. It never consults the operating system's resolver or any
//! cache, which is what makes the router notice the client.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use hickory_proto::op::{Message, MessageType, Query, ResponseCode};
use hickory_proto::rr::{Name, RData, RecordType};
use rand::Rng;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time;
use tracing::{debug, trace};

use crate::config::{UpstreamTarget, DNS_LOOKUP_TIMEOUT};
use crate::dialer::Dialer;
use crate::dns::{select_address, NameResolver, ResolveError};

// Plain DNS without EDNS caps UDP answers at 512 bytes, the extra room only
// matters for misbehaving servers.
const UDP_RECV_BUFFER: usize = 4096;

pub struct RouterDnsResolver {
    upstream: UpstreamTarget,
    dialer: Arc<dyn Dialer>,
    timeout: Duration,
}

impl RouterDnsResolver {
    /// Resolver pinned to `router_ip:53`
    pub fn new(router_ip: IpAddr, dialer: Arc<dyn Dialer>) -> Self {
        Self::with_upstream(UpstreamTarget::new(router_ip), dialer)
    }

    pub fn with_upstream(upstream: UpstreamTarget, dialer: Arc<dyn Dialer>) -> Self {
        Self {
            upstream,
            dialer,
            timeout: DNS_LOOKUP_TIMEOUT,
        }
    }

    #[cfg(test)]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn upstream(&self) -> UpstreamTarget {
        self.upstream
    }

    /// All A and AAAA addresses of `name`, IPv4 first.
    ///
    /// An empty list means the upstream answered without addresses
    /// (including NXDOMAIN). Dropping the future abandons the lookup.
    pub async fn lookup_ip(&self, name: &str) -> Result<Vec<IpAddr>, ResolveError> {
        if let Ok(ip) = name.parse::<IpAddr>() {
            return Ok(vec![ip]);
        }

        match time::timeout(self.timeout, self.lookup_both(name)).await {
            Ok(result) => result,
            Err(..) => Err(ResolveError::Timeout {
                name: name.to_owned(),
                elapsed: self.timeout,
            }),
        }
    }

    async fn lookup_both(&self, name: &str) -> Result<Vec<IpAddr>, ResolveError> {
        let mut fqdn = Name::from_utf8(name).map_err(|source| ResolveError::InvalidName {
            name: name.to_owned(),
            source,
        })?;
        fqdn.set_fqdn(true);

        let (v4, v6) = tokio::join!(
            self.query(fqdn.clone(), RecordType::A),
            self.query(fqdn, RecordType::AAAA)
        );

        // One family failing is fine as long as the other produced addresses
        let mut addrs = Vec::new();
        let mut first_err = None;
        for (record_type, result) in [(RecordType::A, v4), (RecordType::AAAA, v6)] {
            match result {
                Ok(found) => addrs.extend(found),
                Err(err) => {
                    debug!("{} {} lookup via {} failed: {}", name, record_type, self.upstream, err);
                    if first_err.is_none() {
                        first_err = Some(err);
                    }
                }
            }
        }

        match first_err {
            Some(err) if addrs.is_empty() => Err(err),
            _ => {
                debug!("{} resolved via {} to {:?}", name, self.upstream, addrs);
                Ok(addrs)
            }
        }
    }

    async fn query(&self, name: Name, record_type: RecordType) -> Result<Vec<IpAddr>, ResolveError> {
        let request = query_message(name, record_type);
        let payload = request.to_vec().map_err(|source| ResolveError::InvalidName {
            name: request.queries()[0].name().to_utf8(),
            source,
        })?;

        let mut response = self.exchange_udp(&request, &payload).await?;
        if response.truncated() {
            trace!("truncated {} answer from {}, retrying over TCP", record_type, self.upstream);
            response = self.exchange_tcp(&request, &payload).await?;
        }

        self.answer_addrs(&response, record_type)
    }

    async fn exchange_udp(&self, request: &Message, payload: &[u8]) -> Result<Message, ResolveError> {
        let server = self.upstream.addr();
        let unreachable = |source| ResolveError::Unreachable { server, source };

        let socket = self.dialer.connect_udp(server).await.map_err(unreachable)?;
        socket.send(payload).await.map_err(unreachable)?;

        // Anything that is not the answer to this query is dropped; the
        // lookup timeout bounds how long we keep listening.
        let mut buf = vec![0u8; UDP_RECV_BUFFER];
        loop {
            let n = socket.recv(&mut buf).await.map_err(unreachable)?;
            let response = match self.parse(&buf[..n]) {
                Ok(response) => response,
                Err(err) => {
                    trace!("dropping unreadable datagram: {}", err);
                    continue;
                }
            };
            if response.id() != request.id() {
                trace!("dropping stray DNS answer id {} from {}", response.id(), server);
                continue;
            }
            if response.queries() != request.queries() {
                trace!("dropping DNS answer id {} from {} for another question", response.id(), server);
                continue;
            }
            return Ok(response);
        }
    }

    async fn exchange_tcp(&self, request: &Message, payload: &[u8]) -> Result<Message, ResolveError> {
        let server = self.upstream.addr();
        let unreachable = |source| ResolveError::Unreachable { server, source };

        let mut stream = self.dialer.connect_tcp(server).await.map_err(unreachable)?;
        write_framed(&mut stream, payload).await.map_err(unreachable)?;
        let raw = read_framed(&mut stream).await.map_err(unreachable)?;

        let response = self.parse(&raw)?;
        if response.id() != request.id() {
            return Err(ResolveError::Malformed {
                server,
                reason: format!("answer id {} does not match query id {}", response.id(), request.id()),
            });
        }
        Ok(response)
    }

    fn parse(&self, raw: &[u8]) -> Result<Message, ResolveError> {
        let server = self.upstream.addr();
        let message = Message::from_vec(raw).map_err(|err| ResolveError::Malformed {
            server,
            reason: err.to_string(),
        })?;
        if message.message_type() != MessageType::Response {
            return Err(ResolveError::Malformed {
                server,
                reason: "query received where an answer was expected".to_owned(),
            });
        }
        Ok(message)
    }

    fn answer_addrs(&self, response: &Message, record_type: RecordType) -> Result<Vec<IpAddr>, ResolveError> {
        match response.response_code() {
            ResponseCode::NoError => {}
            ResponseCode::NXDomain => return Ok(Vec::new()),
            code => {
                return Err(ResolveError::ServerFailure {
                    server: self.upstream.addr(),
                    code,
                })
            }
        }

        let addrs = response
            .answers()
            .iter()
            .filter_map(|record| match (record.data(), record_type) {
                (Some(RData::A(a)), RecordType::A) => Some(IpAddr::V4(a.0)),
                (Some(RData::AAAA(aaaa)), RecordType::AAAA) => Some(IpAddr::V6(aaaa.0)),
                _ => None,
            })
            .collect();
        Ok(addrs)
    }
}

#[async_trait]
impl NameResolver for RouterDnsResolver {
    async fn resolve(&self, name: &str) -> Result<Option<IpAddr>, ResolveError> {
        let addrs = self.lookup_ip(name).await?;
        Ok(select_address(&addrs))
    }
}

fn query_message(name: Name, record_type: RecordType) -> Message {
    let mut message = Message::new();
    message.set_id(rand::thread_rng().gen());
    message.set_recursion_desired(true);
    message.add_query(Query::query(name, record_type));
    message
}

/// DNS over TCP carries a two byte length before each message
async fn write_framed<W: AsyncWrite + Unpin>(stream: &mut W, payload: &[u8]) -> std::io::Result<()> {
    let mut buf = BytesMut::with_capacity(2 + payload.len());
    buf.put_u16(payload.len() as u16);
    buf.put_slice(payload);
    stream.write_all(&buf).await
}

async fn read_framed<R: AsyncRead + Unpin>(stream: &mut R) -> std::io::Result<Vec<u8>> {
    let size = stream.read_u16().await? as usize;
    let mut buf = vec![0u8; size];
    stream.read_exact(&mut buf).await?;
    Ok(buf)
}
