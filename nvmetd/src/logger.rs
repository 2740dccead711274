use tracing_subscriber::{fmt, EnvFilter};

/// Installs the process-wide `tracing` subscriber. `level` is a filter
/// directive such as "warn", "info", "debug" or "trace", derived from the
/// `--verbose` count; `RUST_LOG` overrides it when set, matching the
/// convention of mapping a CLI verbosity knob onto the crate's default
/// env filter rather than hand-rolling level checks at call sites.
pub fn init(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_names(true)
        .init();
}
