//! macOS tooling the proxy needs answers from: which Chrome is installed,
//! which interface is Wi-Fi, and which DNS server the router handed out.

use std::io;
use std::net::IpAddr;
use std::process::ExitStatus;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tokio::time;
use tracing::debug;

use crate::config::COMMAND_TIMEOUT;

pub const CHROME_APPS: [&str; 2] = ["Google Chrome", "Chromium"];

#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("running '{command}': {source}")]
    Spawn { command: String, source: io::Error },
    #[error("'{command}' timed out after {timeout:?}")]
    Timeout { command: String, timeout: Duration },
    #[error("'{command}' exited with {status}: {stderr}")]
    Failed {
        command: String,
        status: ExitStatus,
        stderr: String,
    },
    #[error("neither Chrome nor Chromium is installed")]
    ChromeNotInstalled,
    #[error("unreadable system_profiler output: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Wi-Fi network interface not found")]
    WifiNotFound,
    #[error("the command '{command}' returned '{output}' for the IP of the router's DNS server, but that's not a valid IP")]
    InvalidRouterIp { command: String, output: String },
}

/// Runs one external command and hands back its trimmed stdout
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, program: &str, args: &[&str]) -> Result<String, ProbeError>;
}

/// Real processes, each bounded by a timeout and killed when it expires
#[derive(Debug, Clone, Copy)]
pub struct SystemCommands {
    pub timeout: Duration,
}

impl Default for SystemCommands {
    fn default() -> Self {
        Self {
            timeout: COMMAND_TIMEOUT,
        }
    }
}

#[async_trait]
impl CommandRunner for SystemCommands {
    async fn run(&self, program: &str, args: &[&str]) -> Result<String, ProbeError> {
        let command = command_line(program, args);
        debug!("running {}", command);

        let mut cmd = Command::new(program);
        cmd.args(args).kill_on_drop(true);

        let output = match time::timeout(self.timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(source)) => return Err(ProbeError::Spawn { command, source }),
            Err(..) => {
                return Err(ProbeError::Timeout {
                    command,
                    timeout: self.timeout,
                })
            }
        };

        if !output.status.success() {
            return Err(ProbeError::Failed {
                command,
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_owned())
    }
}

fn command_line(program: &str, args: &[&str]) -> String {
    std::iter::once(program).chain(args.iter().copied()).collect::<Vec<_>>().join(" ")
}

/// Spotlight lookup; apps Spotlight has not indexed count as missing
pub async fn is_installed(runner: &dyn CommandRunner, app: &str) -> Result<bool, ProbeError> {
    let paths = runner.run("mdfind", &["-name", app]).await?;
    Ok(!paths.is_empty())
}

/// "Google Chrome" if installed, else "Chromium"
pub async fn chrome_app_name(runner: &dyn CommandRunner) -> Result<&'static str, ProbeError> {
    for app in CHROME_APPS {
        if is_installed(runner, app).await? {
            return Ok(app);
        }
    }
    Err(ProbeError::ChromeNotInstalled)
}

/// Device name of the Wi-Fi interface, e.g. `en0`
pub async fn wifi_interface(runner: &dyn CommandRunner) -> Result<String, ProbeError> {
    let report = runner
        .run("system_profiler", &["-json", "-timeout", "5", "SPNetworkDataType"])
        .await?;
    parse_wifi_interface(&report)
}

// `system_profiler -json SPNetworkDataType` prints
// {"SPNetworkDataType": [{"_name": "Wi-Fi", "interface": "en0", ...}, ...]}
#[derive(Debug, Deserialize)]
struct NetworkReport {
    #[serde(rename = "SPNetworkDataType", default)]
    services: Vec<NetworkService>,
}

#[derive(Debug, Deserialize)]
struct NetworkService {
    #[serde(rename = "_name", default)]
    name: String,
    #[serde(default)]
    interface: String,
}

pub fn parse_wifi_interface(report: &str) -> Result<String, ProbeError> {
    let report: NetworkReport = serde_json::from_str(report)?;
    report
        .services
        .into_iter()
        .find(|service| service.name == "Wi-Fi" && !service.interface.is_empty())
        .map(|service| service.interface)
        .ok_or(ProbeError::WifiNotFound)
}

/// DNS server DHCP configured on `iface`, normally the router itself
pub async fn router_dns_ip(runner: &dyn CommandRunner, iface: &str) -> Result<IpAddr, ProbeError> {
    let args = ["getoption", iface, "domain_name_server"];
    let output = runner.run("ipconfig", &args).await?;
    parse_router_ip(&command_line("ipconfig", &args), &output)
}

pub fn parse_router_ip(command: &str, output: &str) -> Result<IpAddr, ProbeError> {
    output.trim().parse().map_err(|_| ProbeError::InvalidRouterIp {
        command: command.to_owned(),
        output: output.to_owned(),
    })
}
