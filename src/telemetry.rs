//! Logging setup for test binaries
//!
//! Suites log through `tracing` like the rest of the crate; this installs a
//! human-readable fmt subscriber filtered by `RUST_LOG`.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Filter used when `RUST_LOG` is unset
pub const DEFAULT_FILTER: &str = "info,vap_library=debug,kube=warn";

/// Install the global subscriber.
///
/// Safe to call more than once: later calls (or a subscriber installed by
/// someone else) are left alone.
pub fn init_test_logging() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_test_writer(),
        )
        .try_init();
}
