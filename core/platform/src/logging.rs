use std::env;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Layer};
use uuid::Uuid;

/// Field name carrying the root cognition id across log lines.
pub const ROOT_COGNITION_FIELD: &str = "root_cognition_id";

/// Environment field name
pub const ENVIRONMENT_FIELD: &str = "environment";

/// Service name field
pub const SERVICE_FIELD: &str = "service";

/// Initialize structured logging for a kernel process.
///
/// Emits JSON lines in prod/staging and human-readable text elsewhere, with
/// the filter taken from the environment (`info` fallback). Calls after a
/// global subscriber is installed, by this function or by the host process,
/// are ignored.
pub fn init_logging(service_name: &str) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let environment = env::var("APP_ENV").unwrap_or_else(|_| "dev".to_string());

    if environment == "prod" || environment == "staging" {
        let json_layer = fmt::layer()
            .json()
            .with_timer(fmt::time::UtcTime::rfc_3339())
            .with_target(true)
            .with_current_span(true)
            .with_span_list(true)
            .with_filter(env_filter);

        let _ = tracing_subscriber::registry().with(json_layer).try_init();
    } else {
        let _ = fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_file(true)
            .with_line_number(true)
            .finish()
            .try_init();
    }

    tracing::info!(
        service = %service_name,
        environment = %environment,
        "logging initialized"
    );
}

/// Use the caller-supplied root id, or mint one for ad-hoc executions.
pub fn ensure_root_id(existing_id: Option<Uuid>) -> Uuid {
    existing_id.unwrap_or_else(Uuid::new_v4)
}
