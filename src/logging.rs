use tracing_subscriber::{EnvFilter, fmt};

/// Installs the global subscriber: compact lines on stderr, filtered by
/// `RUST_LOG` when set, otherwise `info` (`debug` with `verbose`).
pub fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .try_init()
        .ok();
}
