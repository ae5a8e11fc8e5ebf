use crate::errors::PlatformError;
use std::env;
use tracing::{info, info_span, Instrument, Span};
use uuid::Uuid;

/// Initialize logging and emit the startup record. Safe to call more than
/// once; only the first installation wins.
pub fn init_tracing(service_name: &str) -> Result<(), PlatformError> {
    crate::logging::init_logging(service_name);

    let environment = env::var("APP_ENV").unwrap_or_else(|_| "dev".to_string());

    info!(
        service = %service_name,
        environment = %environment,
        event = "startup",
        "tracing initialized"
    );

    Ok(())
}

/// Span wrapping one top-level `execute` call, keyed by the root cognition id.
pub fn execution_span(root_cognition_id: Uuid, operation: &str) -> Span {
    info_span!(
        "execution",
        %operation,
        root_cognition_id = %root_cognition_id,
    )
}

/// Instrument an async kernel operation with its execution span.
pub async fn with_execution_span<F, R>(root_cognition_id: Uuid, operation: &str, f: F) -> R
where
    F: std::future::Future<Output = R>,
{
    let span = execution_span(root_cognition_id, operation);
    f.instrument(span).await
}
