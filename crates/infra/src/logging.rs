use anyhow::Result;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::AppConfig;

/// JSON output in production, compact human-readable output elsewhere.
pub fn init_tracing(config: &AppConfig) -> Result<()> {
    let filter =
        EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = fmt().with_env_filter(filter).with_target(false);

    if config.is_production() {
        builder.json().init();
    } else {
        builder.compact().init();
    }

    Ok(())
}
