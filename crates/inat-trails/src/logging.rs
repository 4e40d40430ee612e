//! Logging setup
//!
//! Honors `RUST_LOG` when set; otherwise logs at debug level in debug builds
//! and at info level in release builds, keeping the HTTP stack quiet.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

const DEBUG_DEFAULT: &str = "debug,hyper_util=info,reqwest::connect=info,rustls=info";
const RELEASE_DEFAULT: &str = "info,hyper_util=warn,reqwest=warn,rustls=warn";

fn default_directives() -> &'static str {
    if cfg!(debug_assertions) {
        DEBUG_DEFAULT
    } else {
        RELEASE_DEFAULT
    }
}

/// Initialize the global subscriber; later calls are no-ops
pub fn setup_logging() {
    let from_env = std::env::var("RUST_LOG").is_ok();
    let filter = if from_env {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new(default_directives())
    };

    let fmt_layer = fmt::layer().with_target(false).with_filter(filter);
    let _ = tracing_subscriber::registry().with(fmt_layer).try_init();

    if !from_env {
        tracing::debug!("RUST_LOG not set, using default: {}", default_directives());
    }
}
