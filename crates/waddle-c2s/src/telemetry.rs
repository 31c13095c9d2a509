//! Tracing subscriber initialisation.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::XmppError;

/// Install the global tracing subscriber.
///
/// `RUST_LOG` wins when set; otherwise `level` (usually
/// `config.logging.level`) is used. Fails if a subscriber is already
/// installed or the filter does not parse.
pub fn init(level: &str) -> Result<(), XmppError> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(level)
            .map_err(|e| XmppError::config(format!("Invalid log filter '{}': {}", level, e)))?,
    };

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|e| XmppError::internal(format!("Failed to install tracing subscriber: {}", e)))?;

    tracing::info!(level, "Telemetry initialized");
    Ok(())
}
