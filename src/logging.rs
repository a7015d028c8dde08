//! Tracing setup shared by embedding binaries and tests

use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info,backend_bridge=debug";

fn env_filter() -> EnvFilter {
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| DEFAULT_FILTER.into());
    EnvFilter::new(filter)
}

/// Install the global subscriber; `json` selects flattened JSON lines
/// instead of the compact human format. Panics if one is already set.
pub fn init_tracing(json: bool) {
    if json {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter())
            .json()
            .flatten_event(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter())
            .compact()
            .init();
    }
}

/// Test-friendly variant: output goes through the test writer and repeated
/// calls are no-ops
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_test_writer()
        .compact()
        .try_init();
}
