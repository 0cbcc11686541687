//! Prometheus metrics recording and endpoint, behind the `metrics` feature.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Install the Prometheus metrics recorder and return the handle for rendering.
pub fn install_prometheus_recorder() -> PrometheusHandle {
    let builder = PrometheusBuilder::new();
    builder.install_recorder().expect("failed to install Prometheus recorder")
}

/// Record a new streaming-mode WebSocket session.
pub fn record_streaming_session_start() {
    metrics::gauge!("echogate_streaming_sessions_active").increment(1.0);
}

pub fn record_streaming_session_end() {
    metrics::gauge!("echogate_streaming_sessions_active").decrement(1.0);
}

/// Record a new push-to-talk session.
pub fn record_push_to_talk_session_start() {
    metrics::gauge!("echogate_push_to_talk_sessions_active").increment(1.0);
}

pub fn record_push_to_talk_session_end() {
    metrics::gauge!("echogate_push_to_talk_sessions_active").decrement(1.0);
}

/// Record a completed, billed request (either pipeline).
pub fn record_request_billed(seconds: i64) {
    metrics::counter!("echogate_requests_billed_total").increment(1);
    metrics::histogram!("echogate_request_billed_seconds").record(seconds as f64);
}

/// Record a balance exhaustion event forcing a disconnect.
pub fn record_balance_exhausted() {
    metrics::counter!("echogate_balance_exhausted_total").increment(1);
}

/// Record time spent waiting to acquire a VAD pool slot.
pub fn record_vad_pool_wait(duration_secs: f64) {
    metrics::histogram!("echogate_vad_pool_wait_seconds").record(duration_secs);
}

/// Record a session evicted by the reaper for exceeding the stale timeout.
pub fn record_reaper_eviction() {
    metrics::counter!("echogate_reaper_evictions_total").increment(1);
}

/// Record an error of a given kind.
pub fn record_error(kind: &str) {
    let labels = [("kind", kind.to_string())];
    metrics::counter!("echogate_errors_total", &labels).increment(1);
}
