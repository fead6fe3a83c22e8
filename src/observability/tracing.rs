use tracing::Span;
use tracing_subscriber::EnvFilter;
use crate::config::LoggingConfig;
use crate::types::ids::{FeedId, RequestId};

/// Installs the global subscriber. `RUST_LOG` wins over the configured level.
pub fn init_tracing(config: &LoggingConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))?;

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if config.json {
        builder.json().try_init().map_err(|e| anyhow::anyhow!(e))?;
    } else {
        builder.try_init().map_err(|e| anyhow::anyhow!(e))?;
    }
    Ok(())
}

pub fn trace_aggregation(feed_id: &FeedId, request_id: &RequestId) -> Span {
    tracing::info_span!(
        "aggregation",
        feed_id = %feed_id,
        request_id = %request_id,
    )
}

pub fn trace_fetch(source_name: &str, attempt: u32) -> Span {
    tracing::debug_span!(
        "fetch",
        source = source_name,
        attempt,
    )
}
