//! Logging setup
//!
//! `RUST_LOG` wins when set; otherwise the configured level applies.

use tracing_subscriber::EnvFilter;

/// Log level names accepted by `init`
pub const LEVELS: [&str; 5] = ["error", "warn", "info", "debug", "trace"];

/// Build the filter for a configured level
pub fn filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = level.to_lowercase();
        if LEVELS.contains(&level.as_str()) {
            EnvFilter::new(level)
        } else {
            EnvFilter::new("warn")
        }
    })
}

/// Install the global fmt subscriber
///
/// Fails if a global subscriber is already installed.
pub fn init(level: &str) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(filter(level))
        .with_target(false)
        .with_thread_ids(true)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .try_init()
}

/// Install a test-writer subscriber, ignoring repeated calls
pub fn init_for_tests() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter("warn"))
        .with_target(false)
        .with_test_writer()
        .try_init();
}
