//! Metrics module for subscription-engine.
//! Provides Prometheus metrics for metering, lifecycle and billing operations.

use once_cell::sync::Lazy;
use prometheus::{
    histogram_opts, opts, register_histogram, register_histogram_vec, register_int_counter_vec,
    Encoder, Histogram, HistogramVec, IntCounterVec, TextEncoder,
};
use std::sync::OnceLock;

/// Database query duration histogram
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        histogram_opts!(
            "engine_db_query_duration_seconds",
            "Database query duration"
        ),
        &["operation"]
    )
    .expect("Failed to register DB_QUERY_DURATION")
});

/// Usage increments counter
pub static USAGE_INCREMENTS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Quota denials counter
pub static QUOTA_DENIALS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// State machine transitions counter
pub static TRANSITIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Billing attempts counter
pub static BILLING_ATTEMPTS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Period rolls counter
pub static PERIOD_ROLLS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Payment gateway charge latency
pub static GATEWAY_CHARGE_DURATION: OnceLock<Histogram> = OnceLock::new();

/// Error counter for alerting
pub static ERRORS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Initialize all metrics. Call once at startup.
pub fn init_metrics() {
    USAGE_INCREMENTS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "engine_usage_increments_total",
                "Total units metered by resource"
            ),
            &["resource"]
        )
        .expect("Failed to register USAGE_INCREMENTS_TOTAL")
    });

    QUOTA_DENIALS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "engine_quota_denials_total",
                "Total reservations refused by resource"
            ),
            &["resource"]
        )
        .expect("Failed to register QUOTA_DENIALS_TOTAL")
    });

    TRANSITIONS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "engine_transitions_total",
                "Total subscription transitions by action and outcome"
            ),
            &["action", "outcome"]
        )
        .expect("Failed to register TRANSITIONS_TOTAL")
    });

    BILLING_ATTEMPTS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "engine_billing_attempts_total",
                "Total billing attempts by status"
            ),
            &["status"]
        )
        .expect("Failed to register BILLING_ATTEMPTS_TOTAL")
    });

    PERIOD_ROLLS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!("engine_period_rolls_total", "Total period roll checks"),
            &["result"]
        )
        .expect("Failed to register PERIOD_ROLLS_TOTAL")
    });

    // Gateway latency with buckets up to the default payment timeout
    GATEWAY_CHARGE_DURATION.get_or_init(|| {
        register_histogram!(histogram_opts!(
            "engine_gateway_charge_duration_seconds",
            "Payment gateway charge duration",
            vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]
        ))
        .expect("Failed to register GATEWAY_CHARGE_DURATION")
    });

    ERRORS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!("engine_errors_total", "Total errors by type for alerting"),
            &["error_type", "operation"]
        )
        .expect("Failed to register ERRORS_TOTAL")
    });

    // Force initialization of lazy statics
    let _ = &*DB_QUERY_DURATION;
}

/// Get metrics in Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::warn!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

/// Record metered units.
pub fn record_usage_increment(resource: &str, amount: u64) {
    if let Some(counter) = USAGE_INCREMENTS_TOTAL.get() {
        counter.with_label_values(&[resource]).inc_by(amount);
    }
}

/// Record a refused reservation.
pub fn record_quota_denial(resource: &str) {
    if let Some(counter) = QUOTA_DENIALS_TOTAL.get() {
        counter.with_label_values(&[resource]).inc();
    }
}

/// Record a transition outcome: applied, replayed or rejected.
pub fn record_transition(action: &str, outcome: &str) {
    if let Some(counter) = TRANSITIONS_TOTAL.get() {
        counter.with_label_values(&[action, outcome]).inc();
    }
}

/// Record a billing attempt status change.
pub fn record_billing_attempt(status: &str) {
    if let Some(counter) = BILLING_ATTEMPTS_TOTAL.get() {
        counter.with_label_values(&[status]).inc();
    }
}

/// Record a period roll check.
pub fn record_period_roll(result: &str) {
    if let Some(counter) = PERIOD_ROLLS_TOTAL.get() {
        counter.with_label_values(&[result]).inc();
    }
}

/// Record payment gateway latency.
pub fn record_gateway_charge_duration(duration_secs: f64) {
    if let Some(histogram) = GATEWAY_CHARGE_DURATION.get() {
        histogram.observe(duration_secs);
    }
}

/// Record an error for alerting.
pub fn record_error(error_type: &str, operation: &str) {
    if let Some(counter) = ERRORS_TOTAL.get() {
        counter.with_label_values(&[error_type, operation]).inc();
    }
}
