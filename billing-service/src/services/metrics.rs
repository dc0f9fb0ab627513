use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the Prometheus recorder. Safe to call once per process; repeated
/// calls (e.g. several test applications in one binary) are ignored.
pub fn init_metrics() {
    let builder = PrometheusBuilder::new();
    if let Ok(handle) = builder.install_recorder() {
        let _ = METRICS_HANDLE.set(handle);
    }
}

/// Render the current metrics in Prometheus exposition format.
pub fn get_metrics() -> String {
    METRICS_HANDLE
        .get()
        .map(|handle| handle.render())
        .unwrap_or_default()
}
