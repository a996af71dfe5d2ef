//! Process-wide tracing setup.

use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info";

/// Install the global subscriber. Logs go to stderr so that stdout stays
/// clean for command output.
///
/// The filter comes from `level`, then `RUST_LOG`, then a default of
/// `info` (`warn` when `quiet`).
pub(crate) fn init(level: Option<&str>, quiet: bool) {
    let fallback = if quiet { "warn" } else { DEFAULT_FILTER };
    let filter = match level {
        Some(level) => EnvFilter::try_new(level).unwrap_or_else(|e| {
            eprintln!("warning: invalid --log-level '{}': {}", level, e);
            EnvFilter::new(fallback)
        }),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback)),
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .try_init();
}
