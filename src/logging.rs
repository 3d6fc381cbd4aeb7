use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info";

/// Plain stderr lines, no timestamps; `RUST_LOG` overrides the level
/// (`RUST_LOG=debug` shows per-connection proxy activity).
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .with_target(false)
        .try_init();
}
