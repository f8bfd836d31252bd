//! Logging setup
//!
//! Everything the daemon says ends up in `tracing`: stdout lines at debug,
//! stderr lines at warn, control events per their severity. The default
//! filter keeps torbind at info; `RUST_LOG=torbind=debug` shows the
//! daemon's own log stream too.

use tracing_subscriber::{fmt, EnvFilter};

/// Initialize the global subscriber with environment-based filtering.
pub fn init() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("torbind=info"));

    fmt().with_env_filter(filter).with_target(true).init();
}
