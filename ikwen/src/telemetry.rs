//! Tracing initialization.
//!
//! Logs go to stdout through a `tracing-subscriber` fmt layer. Verbosity follows `RUST_LOG`
//! and defaults to [`DEFAULT_FILTER`]:
//!
//! ```bash
//! RUST_LOG="info,ikwen::mobile_money=debug" ikwen -f config.yaml
//! ```
//!
//! Scheduled jobs and mobile money pollers log with the tenant in a `service_id` field, so one
//! tenant's activity can be followed with a plain grep.

use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Filter used when `RUST_LOG` is not set. sqlx logs every statement at info.
pub const DEFAULT_FILTER: &str = "info,sqlx=warn";

/// Initialize the global subscriber. Fails if one is already installed.
pub fn init_telemetry() -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .try_init()?;

    info!("Telemetry initialized");
    Ok(())
}
