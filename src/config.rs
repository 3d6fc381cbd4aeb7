use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use crate::dialer::Dialer;
use crate::dns::NameResolver;

/// Address the SOCKS5 proxy listens on.
pub const PROXY_ADDR: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 1666);

/// Unsecured HTTP URL that routers redirect to their captive portal.
pub const PROBE_URL: &str = "http://captive.apple.com";

pub const DNS_PORT: u16 = 53;

pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(5);
pub const BROWSER_LAUNCH_TIMEOUT: Duration = Duration::from_secs(15);
pub const DNS_LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// The router DNS server every lookup is pinned to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpstreamTarget {
    addr: SocketAddr,
}

impl UpstreamTarget {
    pub fn new(ip: IpAddr) -> Self {
        Self {
            addr: SocketAddr::new(ip, DNS_PORT),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

impl fmt::Display for UpstreamTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.addr)
    }
}

/// Everything the proxy server needs, fixed before it starts
#[derive(Clone)]
pub struct ProxyConfig {
    pub listen_addr: SocketAddr,
    pub resolver: Arc<dyn NameResolver>,
    pub dialer: Arc<dyn Dialer>,
    pub handshake_timeout: Duration,
    pub resolve_timeout: Duration,
    pub connect_timeout: Duration,
}

impl ProxyConfig {
    pub fn new(
        listen_addr: SocketAddr,
        resolver: Arc<dyn NameResolver>,
        dialer: Arc<dyn Dialer>,
    ) -> Self {
        Self {
            listen_addr,
            resolver,
            dialer,
            handshake_timeout: HANDSHAKE_TIMEOUT,
            resolve_timeout: DNS_LOOKUP_TIMEOUT,
            connect_timeout: CONNECT_TIMEOUT,
        }
    }
}

impl fmt::Debug for ProxyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyConfig")
            .field("listen_addr", &self.listen_addr)
            .field("handshake_timeout", &self.handshake_timeout)
            .field("resolve_timeout", &self.resolve_timeout)
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_target_pins_port_53() {
        let target = UpstreamTarget::new("192.168.1.1".parse().unwrap());
        assert_eq!(target.addr(), "192.168.1.1:53".parse().unwrap());
        assert_eq!(target.to_string(), "192.168.1.1:53");
    }

    #[test]
    fn upstream_target_ipv6_display() {
        let target = UpstreamTarget::new("fe80::1".parse().unwrap());
        assert_eq!(target.to_string(), "[fe80::1]:53");
    }

    #[test]
    fn proxy_listens_on_loopback() {
        assert!(PROXY_ADDR.ip().is_loopback());
        assert_eq!(PROXY_ADDR.port(), 1666);
    }
}
