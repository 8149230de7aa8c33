pub mod audit;
pub mod config;
pub mod error;
pub mod net;
pub mod proto;
pub mod server;
pub mod session;

pub use error::{Error, Result};

use tracing_subscriber::EnvFilter;

/// Installs the process-wide `tracing` subscriber. The filter is read from `PGPROXY_LOG`,
/// falling back to `RUST_LOG`, defaulting to `info` if neither is set.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_env("PGPROXY_LOG")
        .or_else(|_| EnvFilter::try_from_env("RUST_LOG"))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}
