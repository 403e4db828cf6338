//! Logging and tracing setup.
//!
//! The engine, poller, and registry emit structured `tracing` events with
//! `resource_type`, `id`, and `target` fields. Hosts install a subscriber
//! once at startup. Output goes to **stderr**, leaving stdout to the host
//! process.
//!
//! # Quick Start
//!
//! ```ignore
//! use hemmer_arm_reconcile::init_logging;
//!
//! #[tokio::main]
//! async fn main() {
//!     // Reads RUST_LOG, defaults to info
//!     init_logging();
//!     tracing::info!("provider starting");
//! }
//! ```
//!
//! # Environment Variables
//!
//! - `RUST_LOG`: Controls log levels (e.g., `info`, `hemmer_arm_reconcile::lro=debug`)
//!
//! ```bash
//! # Watch every poll of long-running operations
//! RUST_LOG=info,hemmer_arm_reconcile::lro=debug ./my-provider
//! ```

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

fn stderr_layer<S>() -> impl tracing_subscriber::Layer<S>
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
}

/// Initialize the default logging subscriber.
///
/// Respects `RUST_LOG` and defaults to `info`.
///
/// # Panics
///
/// Panics if a global subscriber has already been set.
pub fn init_logging() {
    init_logging_with_default("info");
}

/// Initialize logging with a custom default level, used when `RUST_LOG` is
/// not set.
///
/// # Panics
///
/// Panics if a global subscriber has already been set.
pub fn init_logging_with_default(default_level: &str) {
    tracing_subscriber::registry()
        .with(filter(default_level))
        .with(stderr_layer())
        .init();
}

/// Try to initialize logging, returning false if a subscriber was already set.
///
/// Useful in tests, where several cases may race to install a subscriber.
pub fn try_init_logging() -> bool {
    tracing_subscriber::registry()
        .with(filter("info"))
        .with(stderr_layer())
        .try_init()
        .is_ok()
}
