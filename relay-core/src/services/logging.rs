//! Logging service

use crate::models::LogLevel;

/// Initialize logging with the specified level. `RUST_LOG` takes precedence when set.
pub fn init_logging(level: LogLevel) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter = match level {
        LogLevel::Error => "relay=error,relay_core=error",
        LogLevel::Warn => "relay=warn,relay_core=warn",
        LogLevel::Info => "relay=info,relay_core=info",
        LogLevel::Debug => "relay=debug,relay_core=debug",
        LogLevel::Trace => "relay=trace,relay_core=trace",
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .try_init()
}

/// Log a delivery outcome for a notification or approval message
pub fn log_delivery(operation: &str, transport: &str, details: Option<&str>) {
    tracing::info!(
        operation = operation,
        transport = transport,
        details = details.unwrap_or(""),
        "Delivery completed"
    );
}

/// Log a security event (always logged regardless of level)
pub fn log_security_event(event_type: &str, source: &str, details: &str) {
    tracing::warn!(
        event_type = event_type,
        source = source,
        details = details,
        "Security event"
    );
}

/// Log a non-fatal delivery failure surfaced to the invoking process
pub fn log_delivery_failure(error: &str, context: Option<&str>) {
    tracing::warn!(
        error = error,
        context = context.unwrap_or(""),
        "Delivery failed"
    );
}
