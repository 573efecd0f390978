//! Logging setup for the CLI.

use std::io::IsTerminal;

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize logging based on `$RUST_LOG`. Logs are disabled when the
/// variable isn't set.
pub fn set_up_logging() {
    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_ansi(should_emit_colors())
        .with_writer(std::io::stderr)
        .compact();

    let filter_layer = EnvFilter::builder().from_env_lossy();

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .init();
}

fn should_emit_colors() -> bool {
    std::io::stderr().is_terminal() && std::env::var_os("NO_COLOR").is_none()
}
