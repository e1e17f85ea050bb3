//! Console logging for binaries and tests that embed the rescan engine.
//!
//! The engine itself only emits `tracing` events; installing a subscriber is
//! the embedding application's call.

use tracing::level_filters::LevelFilter;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Environment variable consulted by [`try_init_from_env`].
pub const LOG_ENV: &str = "NIEBLA_LOG";

/// Install a stderr subscriber at `level`. `RUST_LOG`-style directives in
/// [`LOG_ENV`] refine it.
pub fn init_console_logging(level: LevelFilter) -> anyhow::Result<()> {
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .with_env_var(LOG_ENV)
        .from_env_lossy();

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
        .try_init()
        .map_err(|e| anyhow::anyhow!("subscriber initialization failed: {e}"))
}

/// Best-effort init driven only by [`LOG_ENV`]; a no-op if a subscriber is
/// already installed. Handy at the top of tests.
pub fn try_init_from_env() {
    let _ = init_console_logging(LevelFilter::WARN);
}
