#![cfg_attr(test, allow(clippy::unwrap_used))]

use anyhow::{Context as _, Result};
use tracing::subscriber::DefaultGuard;
use tracing_subscriber::{
    filter::ParseError, fmt, layer::SubscriberExt as _, util::SubscriberInitExt as _, EnvFilter,
    Layer as _, Registry,
};

/// Registers a global subscriber with stdout logging.
///
/// Directives are read from `RUST_LOG`, on top of an opinionated base filter.
/// With `json`, events are emitted as one JSON object per line for log shippers.
pub fn setup_global_subscriber(json: bool) -> Result<()> {
    let directives = std::env::var("RUST_LOG").unwrap_or_default();

    let fmt_layer = if json {
        fmt::layer()
            .json()
            .with_filter(try_filter(&directives).context("Failed to parse directives")?)
            .boxed()
    } else {
        fmt::layer()
            .with_filter(try_filter(&directives).context("Failed to parse directives")?)
            .boxed()
    };

    Registry::default()
        .with(fmt_layer)
        .try_init()
        .context("Could not set global default subscriber")?;

    Ok(())
}

/// Constructs an opinionated [`EnvFilter`] with some crates already silenced.
pub fn try_filter(directives: &str) -> Result<EnvFilter, ParseError> {
    /// A filter directive that silences noisy crates.
    ///
    /// For debugging, it is useful to set a catch-all log like `debug`.
    /// By prepending this directive to the active filter, a simple directive like
    /// `debug` actually produces useful logs. Logs from these crates can still be
    /// activated by restating them with a lower filter, i.e. `hyper=debug`.
    const IRRELEVANT_CRATES: &str = "hyper=warn,rustls=warn,tokio_yamux=warn";

    if directives.is_empty() {
        return EnvFilter::try_new(IRRELEVANT_CRATES);
    }

    EnvFilter::try_new(format!("{IRRELEVANT_CRATES},{directives}"))
}

/// Initialises a logger to be used in tests.
pub fn test(directives: &str) -> DefaultGuard {
    tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(directives)
        .set_default()
}

pub fn test_global(directives: &str) {
    tracing::subscriber::set_global_default(
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_env_filter(directives)
            .finish(),
    )
    .ok();
}
