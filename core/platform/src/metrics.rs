use std::net::SocketAddr;
use std::sync::Once;

use metrics::{counter, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

use crate::errors::{PlatformError, PlatformResult};

/// Ensure we only install a single global recorder even if `init_metrics`
/// is called multiple times.
static INIT: Once = Once::new();

/// Install a Prometheus-backed global recorder exposing `/metrics` on
/// `bind_addr`. Calls after the first successful installation are ignored;
/// kernels that never call this leave every recording helper a no-op.
pub fn init_metrics(bind_addr: SocketAddr) -> PlatformResult<()> {
    let mut init_result: PlatformResult<()> = Ok(());

    INIT.call_once(|| {
        let builder = PrometheusBuilder::new().with_http_listener(bind_addr);

        if let Err(err) = builder.install() {
            init_result = Err(PlatformError::Metrics(format!(
                "failed to install recorder: {err}"
            )));
        }
    });

    init_result
}

/// Record a counter metric by name. `name` must be `'static`; all kernel
/// call sites use string literals.
pub fn record_counter(name: &'static str, value: u64) {
    counter!(name).increment(value);
}

/// Record a histogram metric (seconds unless noted otherwise).
pub fn record_histogram(name: &'static str, value: f64) {
    histogram!(name).record(value);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_without_a_recorder_is_a_no_op() {
        record_counter("platform_test_counter_total", 1);
        record_histogram("platform_test_seconds", 0.25);
    }

    #[test]
    fn init_metrics_is_idempotent() {
        // Port 0 lets the exporter pick any free port. The second call hits
        // the Once guard and must report success without reinstalling.
        let addr = "127.0.0.1:0".parse().expect("socket addr");
        init_metrics(addr).expect("first install should succeed");
        init_metrics(addr).expect("repeat install should be ignored");

        record_counter("platform_test_counter_total", 1);
    }
}
