//! Prometheus metrics for the object host
//!
//! All metrics live in the default prometheus registry and are prefixed with
//! `agenthost_`. [`render`] produces the text exposition format.

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge, register_histogram, register_histogram_vec,
    CounterVec, Encoder, Gauge, Histogram, HistogramVec, TextEncoder,
};

lazy_static! {
    // ─────────────────────────────────────────────────────────────────────────────
    // Request Metrics
    // ─────────────────────────────────────────────────────────────────────────────

    /// Requests received, by gRPC operation.
    pub static ref REQUESTS_TOTAL: CounterVec = register_counter_vec!(
        "agenthost_requests_total",
        "Total gRPC requests received per operation",
        &["operation"]
    ).expect("failed to register REQUESTS_TOTAL metric");

    /// Errors returned to clients, by error kind.
    ///
    /// Labels:
    /// - kind: not_found, already_exists, object_gone, backpressure, ...
    pub static ref ERRORS_TOTAL: CounterVec = register_counter_vec!(
        "agenthost_errors_total",
        "Errors returned to clients per kind",
        &["kind"]
    ).expect("failed to register ERRORS_TOTAL metric");

    /// Requests currently being served.
    pub static ref REQUESTS_IN_FLIGHT: Gauge = register_gauge!(
        "agenthost_requests_in_flight",
        "gRPC requests currently being served"
    ).expect("failed to register REQUESTS_IN_FLIGHT metric");

    /// Wall time spent in each gRPC handler.
    pub static ref GRPC_REQUEST_DURATION: HistogramVec = register_histogram_vec!(
        "agenthost_grpc_request_duration_seconds",
        "gRPC handler duration per operation",
        &["operation"]
    ).expect("failed to register GRPC_REQUEST_DURATION metric");

    // ─────────────────────────────────────────────────────────────────────────────
    // Object & Call Metrics
    // ─────────────────────────────────────────────────────────────────────────────

    /// Objects currently live in the registry.
    pub static ref OBJECTS_LIVE: Gauge = register_gauge!(
        "agenthost_objects_live",
        "Objects currently hosted"
    ).expect("failed to register OBJECTS_LIVE metric");

    /// Completed function calls, by mode and outcome.
    ///
    /// Labels:
    /// - mode: sync | async
    /// - outcome: ok | failed (including caught panics) | an error kind such as
    ///   object_gone, backpressure or shutting_down
    pub static ref CALLS_TOTAL: CounterVec = register_counter_vec!(
        "agenthost_calls_total",
        "Function calls completed per mode and outcome",
        &["mode", "outcome"]
    ).expect("failed to register CALLS_TOTAL metric");

    /// Time spent inside hosted objects.
    pub static ref CALL_DURATION: Histogram = register_histogram!(
        "agenthost_call_duration_seconds",
        "Time spent executing a function on a hosted object"
    ).expect("failed to register CALL_DURATION metric");

    /// Async calls accepted but not finished (queued + running).
    pub static ref ASYNC_OUTSTANDING: Gauge = register_gauge!(
        "agenthost_async_outstanding",
        "Async calls queued or running on the worker pool"
    ).expect("failed to register ASYNC_OUTSTANDING metric");

    /// Placeholders still pending.
    pub static ref PLACEHOLDERS_PENDING: Gauge = register_gauge!(
        "agenthost_placeholders_pending",
        "Placeholders waiting for their call to finish"
    ).expect("failed to register PLACEHOLDERS_PENDING metric");

    /// Placeholders dropped by the TTL sweeper or capacity pressure.
    pub static ref PLACEHOLDERS_EVICTED: CounterVec = register_counter_vec!(
        "agenthost_placeholders_evicted_total",
        "Resolved placeholders evicted before being read again",
        &["reason"]
    ).expect("failed to register PLACEHOLDERS_EVICTED metric");

    /// Bytes streamed by DownloadFile.
    pub static ref DOWNLOAD_BYTES: prometheus::Counter = prometheus::register_counter!(
        "agenthost_download_bytes_total",
        "Bytes sent through DownloadFile"
    ).expect("failed to register DOWNLOAD_BYTES metric");
}

/// Touch gauges so they are exported before the first request.
pub fn init() {
    OBJECTS_LIVE.set(0.0);
    REQUESTS_IN_FLIGHT.set(0.0);
    ASYNC_OUTSTANDING.set(0.0);
    PLACEHOLDERS_PENDING.set(0.0);
}

/// Render every registered metric in the prometheus text format.
pub fn render() -> String {
    let encoder = TextEncoder::new();
    let mut buf = Vec::new();
    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buf) {
        tracing::warn!(error = %e, "failed to encode metrics");
    }
    String::from_utf8_lossy(&buf).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_contains_registered_metrics() {
        init();
        REQUESTS_TOTAL.with_label_values(&["is_alive"]).inc();
        let text = render();
        assert!(text.contains("agenthost_requests_total"));
        assert!(text.contains("agenthost_objects_live"));
    }
}
