//! Prometheus metrics for VARMA

use prometheus::{
    Counter, CounterVec, Gauge, GaugeVec, HistogramVec, register_counter, register_counter_vec,
    register_gauge, register_gauge_vec, register_histogram_vec,
};
use std::sync::OnceLock;

/// Global metrics instance
static METRICS: OnceLock<Metrics> = OnceLock::new();

/// All VARMA metrics
pub struct Metrics {
    // ─────────────────────────────────────────────────────────────────────────
    // Publish path
    // ─────────────────────────────────────────────────────────────────────────
    /// Successful publishes (by topic)
    pub publish_success: CounterVec,

    /// Failed publishes (by topic, reason)
    pub publish_failure: CounterVec,

    /// Retry attempts consumed across all publishes
    pub publish_retries: Counter,

    /// End-to-end publish latency in seconds (by topic)
    pub publish_latency_seconds: HistogramVec,

    // ─────────────────────────────────────────────────────────────────────────
    // Circuit breakers
    // ─────────────────────────────────────────────────────────────────────────
    /// Per-circuit state (0 = closed, 1 = open, 2 = half-open)
    pub circuit_state: GaugeVec,

    /// Times each circuit opened
    pub circuit_opened_total: CounterVec,

    /// Calls rejected by an open circuit
    pub circuit_rejected_total: CounterVec,

    // ─────────────────────────────────────────────────────────────────────────
    // Dead letter queue
    // ─────────────────────────────────────────────────────────────────────────
    /// Messages currently parked
    pub dlq_depth: Gauge,

    /// Messages parked (by dlq topic, error category)
    pub dlq_parked_total: CounterVec,

    /// Reprocessing outcomes (by dlq topic, outcome)
    pub dlq_reprocessed_total: CounterVec,

    /// Age of the oldest parked message in seconds
    pub dlq_oldest_age_seconds: Gauge,

    // ─────────────────────────────────────────────────────────────────────────
    // Schema cache
    // ─────────────────────────────────────────────────────────────────────────
    /// Schema cache hits
    pub schema_cache_hits: Counter,

    /// Schema cache misses (registry fetch required)
    pub schema_cache_misses: Counter,

    // ─────────────────────────────────────────────────────────────────────────
    // Transactions
    // ─────────────────────────────────────────────────────────────────────────
    /// Transaction terminations (by outcome: committed/aborted)
    pub transactions_total: CounterVec,
}

impl Metrics {
    /// Initialize metrics (call once at startup)
    ///
    /// Returns error if metric registration fails.
    pub fn init() -> Result<&'static Metrics, prometheus::Error> {
        if let Some(metrics) = METRICS.get() {
            return Ok(metrics);
        }

        let metrics = Metrics {
            publish_success: register_counter_vec!(
                "varma_publish_success_total",
                "Total successful publishes",
                &["topic"]
            )?,

            publish_failure: register_counter_vec!(
                "varma_publish_failure_total",
                "Total failed publishes",
                &["topic", "reason"]
            )?,

            publish_retries: register_counter!(
                "varma_publish_retries_total",
                "Total retry attempts consumed"
            )?,

            publish_latency_seconds: register_histogram_vec!(
                "varma_publish_latency_seconds",
                "End-to-end publish latency",
                &["topic"],
                // Buckets: 100us to 10s
                vec![0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0]
            )?,

            circuit_state: register_gauge_vec!(
                "varma_circuit_state",
                "Circuit breaker state (0 = closed, 1 = open, 2 = half-open)",
                &["circuit"]
            )?,

            circuit_opened_total: register_counter_vec!(
                "varma_circuit_opened_total",
                "Times each circuit transitioned to open",
                &["circuit"]
            )?,

            circuit_rejected_total: register_counter_vec!(
                "varma_circuit_rejected_total",
                "Calls rejected by an open circuit",
                &["circuit"]
            )?,

            dlq_depth: register_gauge!(
                "varma_dlq_depth",
                "Messages currently parked in the DLQ store"
            )?,

            dlq_parked_total: register_counter_vec!(
                "varma_dlq_parked_total",
                "Messages parked in the DLQ",
                &["dlq_topic", "category"]
            )?,

            dlq_reprocessed_total: register_counter_vec!(
                "varma_dlq_reprocessed_total",
                "DLQ reprocessing outcomes",
                &["dlq_topic", "outcome"]
            )?,

            dlq_oldest_age_seconds: register_gauge!(
                "varma_dlq_oldest_age_seconds",
                "Age of the oldest parked message"
            )?,

            schema_cache_hits: register_counter!(
                "varma_schema_cache_hits_total",
                "Schema lookups served from the local cache"
            )?,

            schema_cache_misses: register_counter!(
                "varma_schema_cache_misses_total",
                "Schema lookups requiring a registry fetch"
            )?,

            transactions_total: register_counter_vec!(
                "varma_transactions_total",
                "Transaction terminations",
                &["outcome"]
            )?,
        };

        Ok(METRICS.get_or_init(|| metrics))
    }

    /// Get metrics if initialized
    pub fn get() -> Option<&'static Metrics> {
        METRICS.get()
    }

    /// Record a successful publish with its latency
    pub fn record_publish_success(&self, topic: &str, latency_seconds: f64) {
        self.publish_success.with_label_values(&[topic]).inc();
        self.publish_latency_seconds
            .with_label_values(&[topic])
            .observe(latency_seconds);
    }

    /// Record a failed publish
    pub fn record_publish_failure(&self, topic: &str, reason: &str) {
        self.publish_failure
            .with_label_values(&[topic, reason])
            .inc();
    }

    /// Record retry attempts consumed
    pub fn record_retries(&self, count: u64) {
        self.publish_retries.inc_by(count as f64);
    }

    /// Update the per-circuit state gauge
    pub fn set_circuit_state(&self, circuit: &str, value: f64) {
        self.circuit_state.with_label_values(&[circuit]).set(value);
    }

    /// Count a circuit-open transition
    pub fn record_circuit_opened(&self, circuit: &str) {
        self.circuit_opened_total
            .with_label_values(&[circuit])
            .inc();
    }

    /// Count a rejection by an open circuit
    pub fn record_circuit_rejected(&self, circuit: &str) {
        self.circuit_rejected_total
            .with_label_values(&[circuit])
            .inc();
    }

    /// Record a message parked in the DLQ
    pub fn record_parked(&self, dlq_topic: &str, category: &str) {
        self.dlq_parked_total
            .with_label_values(&[dlq_topic, category])
            .inc();
    }

    /// Record a reprocessing outcome ("reprocessed" or "reparked")
    pub fn record_reprocessed(&self, dlq_topic: &str, outcome: &str) {
        self.dlq_reprocessed_total
            .with_label_values(&[dlq_topic, outcome])
            .inc();
    }

    /// Update DLQ depth gauge
    pub fn set_dlq_depth(&self, depth: usize) {
        self.dlq_depth.set(depth as f64);
    }

    /// Update the oldest-parked-message age gauge
    pub fn set_dlq_oldest_age(&self, seconds: f64) {
        self.dlq_oldest_age_seconds.set(seconds);
    }

    /// Record a transaction termination ("committed" or "aborted")
    pub fn record_transaction(&self, outcome: &str) {
        self.transactions_total.with_label_values(&[outcome]).inc();
    }
}
