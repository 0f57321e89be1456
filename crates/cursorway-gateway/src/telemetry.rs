//! Logging setup
//!
//! `RUST_LOG` wins over the configured level when set.

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global tracing subscriber
pub fn init(log_level: &str, json_logs: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if json_logs {
        // JSON formatted logs for production
        subscriber
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()?;
    } else {
        subscriber.with(tracing_subscriber::fmt::layer()).try_init()?;
    }

    Ok(())
}
