//! DNS resolution seam between the proxy and the router-pinned resolver
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use hickory_proto::op::ResponseCode;
use hickory_proto::error::ProtoError;

/// Resolution capability the proxy server depends on.
///
/// `Ok(None)` means the name exists in no usable form: the upstream answered,
/// but with zero addresses. Failures to get an answer at all are `Err`.
#[async_trait]
pub trait NameResolver: Send + Sync {
    async fn resolve(&self, name: &str) -> Result<Option<IpAddr>, ResolveError>;
}

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("invalid domain name {name:?}: {source}")]
    InvalidName { name: String, source: ProtoError },
    #[error("DNS server {server} unreachable: {source}")]
    Unreachable { server: SocketAddr, source: io::Error },
    #[error("malformed response from DNS server {server}: {reason}")]
    Malformed { server: SocketAddr, reason: String },
    #[error("DNS server {server} answered {code}")]
    ServerFailure { server: SocketAddr, code: ResponseCode },
    #[error("DNS lookup of {name:?} timed out after {elapsed:?}")]
    Timeout { name: String, elapsed: Duration },
}

/// Pick the one address a SOCKS5 CONNECT will dial.
///
/// The first IPv4 address wins; without one, the first address of any family.
pub fn select_address(addrs: &[IpAddr]) -> Option<IpAddr> {
    addrs
        .iter()
        .find(|addr| addr.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
}
