//! Logging utilities for the PeerVault transport
//!
//! The library logs through the `tracing` facade and stays
//! subscriber-agnostic; only binaries and tests configure subscribers.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::TransportConfig;

/// Initialize a tracing subscriber with sensible defaults.
///
/// Filtering comes from `RUST_LOG` (default: "info"), e.g.
/// `RUST_LOG=peervault_transport=debug,peervault_mock=trace`.
///
/// # Panics
/// Panics if a subscriber is already installed (call once per process).
pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    init_with(env_filter);
}

/// Initialize with a programmatic filter, e.g. `"debug"`.
pub fn init_tracing_with_filter(filter: &str) {
    init_with(EnvFilter::new(filter));
}

/// Initialize from the transport config: the `debug` flag selects verbose
/// tracing for the PeerVault crates.
pub fn init_from_config(config: &TransportConfig) {
    if config.debug {
        init_tracing_with_filter("info,peervault_transport=debug,peervault_mock=debug");
    } else {
        init_tracing();
    }
}

fn init_with(env_filter: EnvFilter) {
    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_target(true)
                .with_level(true)
                .with_thread_ids(false)
                .compact(),
        )
        .init();
}
