//! Tracing initialization.
//!
//! Embedding harnesses usually install their own subscriber; these helpers
//! exist for standalone use and for tests. Initialization is idempotent.

use once_cell::sync::OnceCell;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static INIT: OnceCell<()> = OnceCell::new();

/// Install the global subscriber, honoring `RUST_LOG` when set.
/// Safe to call more than once; later calls are no-ops.
pub fn init_tracing() {
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    init_tracing_with_filter(&filter);
}

/// Install the global subscriber with an explicit filter string.
pub fn init_tracing_with_filter(filter: &str) {
    INIT.get_or_init(|| {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_level(true)
            .compact()
            .with_writer(std::io::stderr);

        let filter_layer = EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new("warn"));

        // try_init so an outer subscriber (e.g. a test harness) wins quietly.
        let _ = tracing_subscriber::registry()
            .with(filter_layer)
            .with(fmt_layer)
            .try_init();
    });
}
