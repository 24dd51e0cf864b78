//! Structured logging setup for the daemon.
//!
//! The filter string uses `EnvFilter` directive syntax, e.g.
//! `info` or `shelfsyncd=debug,sqlx=warn`. Dependencies default to `warn`
//! unless the directive names them.

use anyhow::Context;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

pub const DEFAULT_LOG_FILTER: &str = "info";

pub fn build_filter(filter: &str) -> anyhow::Result<EnvFilter> {
    let filter = filter.trim();
    let directives = if filter.is_empty() {
        DEFAULT_LOG_FILTER
    } else {
        filter
    };
    let full = if directives.contains('=') {
        directives.to_string()
    } else {
        format!(
            "{level},shelfsyncd={level},shelfsync_core={level},sqlx=warn,notify=warn",
            level = directives
        )
    };
    EnvFilter::try_new(&full).with_context(|| format!("invalid log filter: {full}"))
}

/// Installs the global subscriber. Fails if one is already set.
pub fn init_logging(filter: &str) -> anyhow::Result<()> {
    let filter = build_filter(filter)?;
    let fmt_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_target(true)
        .with_writer(std::io::stderr);
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()
        .context("failed to install tracing subscriber")
}
