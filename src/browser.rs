use std::io;
use std::net::SocketAddr;
use std::process::ExitStatus;
use std::time::Duration;

use tokio::time;
use tracing::info;

use crate::config::PROBE_URL;

// Adapted from captive-browser's mac Chrome profile. A separate profile in
// incognito mode keeps Chrome from answering lookups out of its own cache;
// the host resolver rules force every name through the SOCKS5 proxy.
//
//   --wait-apps   block until Chrome is closed
//   --new         new Chrome instance even if one is already running
//   --background  don't bring it to the foreground
//
// $1 is the app name, $2 the URL to open.
const OPEN_CHROME_SCRIPT: &str = r#"open --new \
  --wait-apps \
  -a "$1" \
  --background \
  --args \
    --user-data-dir="$HOME/Library/Application Support/Google/Captive" \
    --proxy-server="socks5://$PROXY" \
    --host-resolver-rules="MAP * ~NOTFOUND , EXCLUDE localhost" \
    --no-first-run \
    --new-window \
    --incognito \
  "$2""#;

#[derive(Debug, thiserror::Error)]
pub enum BrowserError {
    #[error("starting {app}: {source}")]
    Spawn { app: String, source: io::Error },
    #[error("{app} exited with {status}")]
    Exited { app: String, status: ExitStatus },
    #[error("{app} did not finish within {timeout:?}")]
    Timeout { app: String, timeout: Duration },
}

/// Shell command that opens `app` on the probe URL through the proxy.
/// `PROXY` is the only variable added to the environment.
pub fn chrome_command(app: &str, proxy: SocketAddr) -> std::process::Command {
    let mut cmd = std::process::Command::new("/bin/sh");
    cmd.arg("-c")
        .arg(OPEN_CHROME_SCRIPT)
        .arg("sh")
        .arg(app)
        .arg(PROBE_URL)
        .env("PROXY", proxy.to_string());
    cmd
}

/// Open the probe URL and wait for the launcher, at most `timeout`
pub async fn launch_chrome(app: &str, proxy: SocketAddr, timeout: Duration) -> Result<(), BrowserError> {
    info!("Opening {} in {} via socks5://{}", PROBE_URL, app, proxy);

    let mut cmd = tokio::process::Command::from(chrome_command(app, proxy));
    cmd.kill_on_drop(true);

    match time::timeout(timeout, cmd.status()).await {
        Ok(Ok(status)) if status.success() => Ok(()),
        Ok(Ok(status)) => Err(BrowserError::Exited {
            app: app.to_owned(),
            status,
        }),
        Ok(Err(source)) => Err(BrowserError::Spawn {
            app: app.to_owned(),
            source,
        }),
        Err(..) => Err(BrowserError::Timeout {
            app: app.to_owned(),
            timeout,
        }),
    }
}
