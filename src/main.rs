mod async_tunnel;
mod browser;
mod cli;
mod config;
mod dialer;
mod dns;
mod dns_resolver;
mod logging;
mod os_probe;
mod proxy;
mod socks5;
#[cfg(test)]
mod test_support;
mod tunnel_stats;

use std::io;
use std::sync::Arc;

use tracing::{error, info};

use crate::browser::BrowserError;
use crate::cli::CliAction;
use crate::config::{ProxyConfig, BROWSER_LAUNCH_TIMEOUT, PROXY_ADDR};
use crate::dialer::{Dialer, TokioDialer};
use crate::dns_resolver::RouterDnsResolver;
use crate::os_probe::{ProbeError, SystemCommands};
use crate::proxy::ProxyServer;

/// Setup failures; each names the step that failed
#[derive(Debug, thiserror::Error)]
enum SetupError {
    #[error("Error checking if Chrome is installed: {0}")]
    Chrome(ProbeError),
    #[error("Error getting Wi-Fi network interface: {0}")]
    WifiInterface(ProbeError),
    #[error("Error getting router's DNS IP: {0}")]
    RouterIp(ProbeError),
    #[error("Error starting SOCKS5 proxy server: {0}")]
    ProxyStart(io::Error),
    #[error("SOCKS5 proxy server stopped: {0}")]
    ProxyStopped(io::Error),
    #[error("Error making unsecured HTTP request with Chrome: {0}")]
    Browser(BrowserError),
}

// Routers only show their captive portal after seeing a DNS query from the
// client followed by a plain HTTP request. Browser and OS resolvers cache, so
// the query may never reach the router. The proxy sends every lookup straight
// to the router's DNS server, and Chrome runs in incognito mode through it
// against http://captive.apple.com, which the router then redirects.
#[tokio::main]
async fn main() {
    if let CliAction::Exit(code) = cli::parse_args(std::env::args_os()) {
        std::process::exit(code);
    }

    logging::init();

    if let Err(err) = run().await {
        error!("{}", err);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), SetupError> {
    let commands = SystemCommands::default();

    let chrome = os_probe::chrome_app_name(&commands)
        .await
        .map_err(SetupError::Chrome)?;
    info!("{} is installed.", chrome);

    info!("Getting Wi-Fi network interface...");
    let iface = os_probe::wifi_interface(&commands)
        .await
        .map_err(SetupError::WifiInterface)?;
    info!("The Wi-Fi interface is {}", iface);

    info!("Getting router's DNS IP...");
    let router_ip = os_probe::router_dns_ip(&commands, &iface)
        .await
        .map_err(SetupError::RouterIp)?;
    info!("The router DNS server's IP is {}", router_ip);

    let dialer: Arc<dyn Dialer> = Arc::new(TokioDialer);
    let resolver = RouterDnsResolver::new(router_ip, dialer.clone());
    info!("Starting SOCKS5 proxy server pointing to DNS server at {}", resolver.upstream());

    let config = ProxyConfig::new(PROXY_ADDR, Arc::new(resolver), dialer);
    let proxy = ProxyServer::bind(config)
        .and_then(ProxyServer::spawn)
        .map_err(SetupError::ProxyStart)?;
    let proxy_addr = proxy.local_addr();
    let stats = proxy.stats();

    tokio::select! {
        launched = browser::launch_chrome(chrome, proxy_addr, BROWSER_LAUNCH_TIMEOUT) => {
            launched.map_err(SetupError::Browser)?;
        }
        stopped = proxy.wait() => {
            let err = stopped
                .err()
                .unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, "accept loop exited"));
            return Err(SetupError::ProxyStopped(err));
        }
    }

    stats.log_stats();
    Ok(())
}
