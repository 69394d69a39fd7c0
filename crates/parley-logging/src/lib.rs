//! Tracing setup shared by Parley binaries.
//!
//! `RUST_LOG` wins when set; otherwise the caller's default directives apply.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global subscriber.
///
/// Returns `false` if a subscriber was already installed (e.g. by an
/// earlier test in the same process).
pub fn init(default_directives: &str) -> bool {
    tracing_subscriber::registry()
        .with(filter(default_directives))
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .is_ok()
}

/// Install a subscriber that writes through the test harness capture.
pub fn init_for_tests() -> bool {
    tracing_subscriber::registry()
        .with(filter("parley=debug"))
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .try_init()
        .is_ok()
}

fn filter(default_directives: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| default_directives.into())
}
