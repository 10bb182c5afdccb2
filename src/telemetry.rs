// Tracing subscriber setup for binaries and tests embedding the orchestrator.
// RUST_LOG overrides the default directive.

use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

// Returns false when a global subscriber was already installed
pub fn init_tracing(default_filter: &str) -> bool {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
        .is_ok()
}
