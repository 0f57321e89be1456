//! Prometheus Metrics for the cursorway gateway
//!
//! Exports metrics for:
//! - Execution outcomes and durations
//! - Rows delivered to clients
//! - Open data sources, connections and cursors
//! - API errors by category

use once_cell::sync::Lazy;
use prometheus::{
    register_histogram_vec, register_int_counter, register_int_counter_vec, register_int_gauge,
    Encoder, HistogramVec, IntCounter, IntCounterVec, IntGauge, TextEncoder,
};

// ═══════════════════════════════════════════════════════════════════════════
// EXECUTION METRICS
// ═══════════════════════════════════════════════════════════════════════════

/// Executions that reached a terminal state, by outcome
pub static EXECUTIONS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "cursorway_executions_total",
        "Executions by terminal outcome",
        &["outcome"]
    )
    .unwrap()
});

/// Time from submission to terminal state
pub static EXECUTION_DURATION_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "cursorway_execution_duration_seconds",
        "Execution wall time from submit to terminal state",
        &["outcome"],
        vec![0.001, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0, 120.0, 600.0]
    )
    .unwrap()
});

/// Rows returned by fetch requests
pub static ROWS_FETCHED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "cursorway_rows_fetched_total",
        "Rows delivered to clients by fetch"
    )
    .unwrap()
});

// ═══════════════════════════════════════════════════════════════════════════
// RESOURCE METRICS
// ═══════════════════════════════════════════════════════════════════════════

pub static ACTIVE_DATA_SOURCES: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "cursorway_active_data_sources",
        "Registered data sources"
    )
    .unwrap()
});

pub static ACTIVE_CONNECTIONS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "cursorway_active_connections",
        "Open engine connections"
    )
    .unwrap()
});

pub static ACTIVE_CURSORS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!("cursorway_active_cursors", "Open cursors").unwrap()
});

/// Cursors closed by the idle reaper
pub static CURSORS_REAPED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "cursorway_cursors_reaped_total",
        "Cursors closed after exceeding the idle timeout"
    )
    .unwrap()
});

// ═══════════════════════════════════════════════════════════════════════════
// API METRICS
// ═══════════════════════════════════════════════════════════════════════════

pub static API_ERRORS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "cursorway_api_errors_total",
        "Error responses by category",
        &["category"]
    )
    .unwrap()
});

/// Initialize all metrics (call at startup)
pub fn init_metrics() {
    // Touch all lazy statics to register them
    let _ = &*EXECUTIONS_TOTAL;
    let _ = &*EXECUTION_DURATION_SECONDS;
    let _ = &*ROWS_FETCHED_TOTAL;
    let _ = &*ACTIVE_DATA_SOURCES;
    let _ = &*ACTIVE_CONNECTIONS;
    let _ = &*ACTIVE_CURSORS;
    let _ = &*CURSORS_REAPED_TOTAL;
    let _ = &*API_ERRORS_TOTAL;
}

/// Encode all registered metrics in the Prometheus text format
pub fn encode_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::warn!("Failed to encode metrics: {}", e);
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

/// Record an execution reaching a terminal state
pub fn record_execution(outcome: &str, duration_secs: f64) {
    EXECUTIONS_TOTAL.with_label_values(&[outcome]).inc();
    EXECUTION_DURATION_SECONDS
        .with_label_values(&[outcome])
        .observe(duration_secs);
}

pub fn record_rows_fetched(rows: usize) {
    ROWS_FETCHED_TOTAL.inc_by(rows as u64);
}

pub fn record_cursors_reaped(count: usize) {
    CURSORS_REAPED_TOTAL.inc_by(count as u64);
}

pub fn record_api_error(category: &str) {
    API_ERRORS_TOTAL.with_label_values(&[category]).inc();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_contains_registered_metrics() {
        init_metrics();
        record_execution("completed", 0.01);
        record_rows_fetched(3);

        let text = encode_metrics();
        assert!(text.contains("cursorway_executions_total"));
        assert!(text.contains("cursorway_rows_fetched_total"));
    }
}
