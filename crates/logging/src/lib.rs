//! RelayCraft Logging
//!
//! `tracing` subscriber setup shared by binaries and test harnesses.
//! `RUST_LOG` overrides the default filter.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Filter used when `RUST_LOG` is unset
pub const DEFAULT_FILTER: &str = "info,relaycraft=debug";

fn env_filter(default_filter: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter))
}

/// Install the global subscriber. Panics if one is already installed.
pub fn init_logging(default_filter: &str) {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(env_filter(default_filter))
        .init();
}

/// Like [`init_logging`], but returns `false` instead of panicking when a
/// subscriber is already installed. Writes through the test writer so
/// output is captured per test.
pub fn try_init_logging(default_filter: &str) -> bool {
    tracing_subscriber::registry()
        .with(fmt::layer().with_test_writer())
        .with(env_filter(default_filter))
        .try_init()
        .is_ok()
}
