use std::ffi::OsString;

use clap::error::ErrorKind;
use clap::Parser;

// Name and version first, like the usual `tool x.y.z` banner
const HELP_TEMPLATE: &str = "\
{name} {version}
{about-with-newline}
{usage-heading} {usage}

{all-args}{after-help}";

/// Trigger the captive portal on a public Wi-Fi network.
///
/// Starts a SOCKS5 proxy on localhost whose DNS lookups all go to the Wi-Fi
/// router's DNS server, then opens Chrome through it on
/// http://captive.apple.com.
#[derive(Parser, Debug)]
#[command(
    name = "trigger-captive-portal",
    version,
    disable_version_flag = true,
    help_template = HELP_TEMPLATE
)]
pub struct Cli {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CliAction {
    Run,
    Exit(i32),
}

/// No arguments are accepted; `-h`/`--help` prints usage and exits 0,
/// anything else prints usage with the error and exits 1.
pub fn parse_args<I, T>(args: I) -> CliAction
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    match Cli::try_parse_from(args) {
        Ok(_) => CliAction::Run,
        Err(err) => {
            let _ = err.print();
            match err.kind() {
                ErrorKind::DisplayHelp => CliAction::Exit(0),
                _ => CliAction::Exit(1),
            }
        }
    }
}
