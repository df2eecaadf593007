//! Dead letter capture and reprocessing
//!
//! Messages that exhaust retries or fail terminally are parked in a
//! [`DlqStore`] keyed by a deterministic [`DlqMessageId`], so re-parking
//! the same message updates its record instead of duplicating it. The
//! [`DeadLetterRouter`] classifies failures, runs a background monitor
//! task for alerting gauges, and republishes parked messages through the
//! [`Republisher`] seam.

use crate::error::{DeliveryError, Result};
use crate::metrics::Metrics;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use varma_core::Message;

/// Poison-vs-transient classification of a parked failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Failure that may succeed on a later attempt (network, timeout,
    /// open circuit)
    Transient,
    /// Failure that will never succeed without intervention
    Poison,
}

impl ErrorCategory {
    /// Classify a delivery error for DLQ routing
    pub fn from_error(error: &DeliveryError) -> Self {
        match error {
            DeliveryError::Transient(_)
            | DeliveryError::Timeout(_)
            | DeliveryError::CircuitOpen(_) => ErrorCategory::Transient,
            _ => ErrorCategory::Poison,
        }
    }

    /// Stable label for metrics and summaries
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Transient => "transient",
            ErrorCategory::Poison => "poison",
        }
    }
}

/// Deterministic DLQ record key
///
/// Derived from the dlq topic and the original message id, so routing the
/// same message to the same dlq topic twice resolves to one record.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DlqMessageId(String);

impl DlqMessageId {
    /// Derive the key for a message parked on a dlq topic
    pub fn derive(dlq_topic: &str, message_id: varma_core::MessageId) -> Self {
        Self(format!("{dlq_topic}:{message_id}"))
    }
}

impl fmt::Display for DlqMessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A parked message with failure metadata
#[derive(Debug, Clone)]
pub struct DlqMessage {
    /// Record key
    pub id: DlqMessageId,
    /// The original message (payload shared zero-copy)
    pub message: Message,
    /// Human-readable failure description from the last attempt
    pub failure_reason: String,
    /// Poison-vs-transient classification
    pub category: ErrorCategory,
    /// Delivery attempts so far; monotonically increasing except when an
    /// operator resets it for manual reprocessing
    pub retry_count: u32,
    /// When the message first failed
    pub first_failed_at: DateTime<Utc>,
    /// When the message last failed
    pub last_attempt_at: DateTime<Utc>,
    /// Dead letter topic the record belongs to
    pub dlq_topic: String,
}

/// Configuration for DLQ behavior
#[derive(Debug, Clone)]
pub struct DlqConfig {
    /// Maximum number of parked messages to retain
    pub capacity: usize,
    /// Suffix appended to the source topic to form the dlq topic
    pub topic_suffix: String,
    /// Interval of the background monitor task
    pub monitor_interval: Duration,
}

impl Default for DlqConfig {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            topic_suffix: ".dlq".to_string(),
            monitor_interval: Duration::from_secs(10),
        }
    }
}

/// Keyed store of parked messages
///
/// In-memory reference implementation of the persisted DLQ state. Keyed
/// by [`DlqMessageId`]; parking an existing key updates the record in
/// place (idempotent re-park).
pub struct DlqStore {
    entries: Mutex<HashMap<DlqMessageId, DlqMessage>>,
    capacity: usize,
    /// Metrics: records ever parked (including re-parks)
    parked_total: AtomicU64,
    /// Metrics: records evicted due to capacity
    dropped_total: AtomicU64,
}

impl DlqStore {
    /// Create a store with the given capacity
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            capacity,
            parked_total: AtomicU64::new(0),
            dropped_total: AtomicU64::new(0),
        }
    }

    /// Park a message, updating the existing record if the key is present
    ///
    /// Returns the stored record's key. On update, `retry_count` takes the
    /// larger of the stored and incoming values so the counter stays
    /// monotonic, and `first_failed_at` is preserved.
    pub fn park(&self, incoming: DlqMessage) -> DlqMessageId {
        let key = incoming.id.clone();
        let mut entries = self.entries.lock();

        self.parked_total.fetch_add(1, Ordering::Relaxed);

        if let Some(existing) = entries.get_mut(&key) {
            existing.retry_count = existing.retry_count.max(incoming.retry_count);
            existing.last_attempt_at = incoming.last_attempt_at;
            existing.failure_reason = incoming.failure_reason;
            existing.category = incoming.category;
            return key;
        }

        if entries.len() >= self.capacity {
            // Evict the oldest record to stay bounded
            if let Some(oldest) = entries
                .values()
                .min_by_key(|e| e.first_failed_at)
                .map(|e| e.id.clone())
            {
                entries.remove(&oldest);
                self.dropped_total.fetch_add(1, Ordering::Relaxed);
            }
        }

        entries.insert(key.clone(), incoming);
        key
    }

    /// Fetch a record by key
    pub fn get(&self, id: &DlqMessageId) -> Option<DlqMessage> {
        self.entries.lock().get(id).cloned()
    }

    /// Remove a record, returning it if present
    pub fn remove(&self, id: &DlqMessageId) -> Option<DlqMessage> {
        self.entries.lock().remove(id)
    }

    /// Remove up to `limit` records parked on `dlq_topic`, oldest first
    pub fn take_for_topic(&self, dlq_topic: &str, limit: usize) -> Vec<DlqMessage> {
        let mut entries = self.entries.lock();
        let mut keys: Vec<_> = entries
            .values()
            .filter(|e| e.dlq_topic == dlq_topic)
            .map(|e| (e.first_failed_at, e.id.clone()))
            .collect();
        keys.sort();

        keys.into_iter()
            .take(limit)
            .filter_map(|(_, key)| entries.remove(&key))
            .collect()
    }

    /// Remove records older than `age`, returning how many were purged
    pub fn purge_older_than(&self, age: Duration) -> usize {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(age).unwrap_or_else(|_| chrono::Duration::seconds(0));
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, e| e.first_failed_at >= cutoff);
        before - entries.len()
    }

    /// Current number of parked records
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether the store is empty
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Records ever parked (including re-parks)
    pub fn parked_total(&self) -> u64 {
        self.parked_total.load(Ordering::Relaxed)
    }

    /// Records evicted due to capacity
    pub fn dropped_total(&self) -> u64 {
        self.dropped_total.load(Ordering::Relaxed)
    }

    /// Per-dlq-topic record counts
    pub fn counts_by_topic(&self) -> HashMap<String, usize> {
        let entries = self.entries.lock();
        let mut counts: HashMap<String, usize> = HashMap::new();
        for e in entries.values() {
            *counts.entry(e.dlq_topic.clone()).or_default() += 1;
        }
        counts
    }

    /// Per-category record counts
    pub fn counts_by_category(&self) -> HashMap<&'static str, usize> {
        let entries = self.entries.lock();
        let mut counts: HashMap<&'static str, usize> = HashMap::new();
        for e in entries.values() {
            *counts.entry(e.category.as_str()).or_default() += 1;
        }
        counts
    }

    /// Age of the oldest parked record
    pub fn oldest_age(&self) -> Option<Duration> {
        let entries = self.entries.lock();
        entries
            .values()
            .map(|e| e.first_failed_at)
            .min()
            .map(|first| (Utc::now() - first).to_std().unwrap_or(Duration::ZERO))
    }
}

/// Seam through which the router republishes parked messages
///
/// Implemented by the `Publisher`: republish delivers through the guarded
/// send path only - no validation gate, no DLQ routing - so a failed
/// reprocess is re-parked by the router rather than double-routed.
#[async_trait]
pub trait Republisher: Send + Sync {
    /// Attempt redelivery of a parked message
    ///
    /// Returns `Ok(true)` on delivery, `Ok(false)` or `Err` on failure.
    async fn republish(&self, message: Message, retry_count: u32) -> Result<bool>;
}

/// Outcome of routing a failed message
#[derive(Debug, Clone)]
pub struct RouteOutcome {
    /// Whether the failure is transient and eligible for reprocessing
    pub retry_eligible: bool,
    /// Key of the parked record
    pub dlq_message_id: DlqMessageId,
}

/// Report from a reprocessing pass
#[derive(Debug, Clone, Default)]
pub struct ReprocessReport {
    /// Messages successfully redelivered and removed from the store
    pub reprocessed: usize,
    /// Messages that failed again and were re-parked
    pub failed: usize,
    /// Failure descriptions for the re-parked messages
    pub errors: Vec<String>,
}

/// Counter snapshot of DLQ activity
#[derive(Debug, Clone, Copy)]
pub struct DlqMetrics {
    /// Records currently parked
    pub depth: usize,
    /// Records ever parked, including re-parks
    pub parked_total: u64,
    /// Records evicted due to capacity
    pub dropped_total: u64,
    /// Reprocessing attempts that failed and were re-parked
    pub reprocess_failures: u64,
}

/// Summary of DLQ state for alerting
#[derive(Debug, Clone)]
pub struct DlqSummary {
    /// Total parked records
    pub depth: usize,
    /// Records per dlq topic
    pub by_topic: HashMap<String, usize>,
    /// Records per error category
    pub by_category: HashMap<&'static str, usize>,
    /// Age of the oldest parked record
    pub oldest_age: Option<Duration>,
    /// Reprocessing attempts that failed and were re-parked
    pub reprocess_failures: u64,
}

/// Routes permanently failed messages to the DLQ store and reprocesses
/// parked messages
pub struct DeadLetterRouter {
    store: Arc<DlqStore>,
    config: DlqConfig,
    /// Background monitor task handle and its shutdown signal
    monitor: Mutex<Option<(watch::Sender<bool>, tokio::task::JoinHandle<()>)>>,
    /// Serializes reprocessing passes; `stop()` acquires it to drain
    /// in-flight work
    reprocess_gate: tokio::sync::Mutex<()>,
    /// Metrics: reprocess attempts that failed and were re-parked
    reprocess_failures: AtomicU64,
}

impl DeadLetterRouter {
    /// Create a router over its own store
    pub fn new(config: DlqConfig) -> Self {
        Self {
            store: Arc::new(DlqStore::new(config.capacity)),
            config,
            monitor: Mutex::new(None),
            reprocess_gate: tokio::sync::Mutex::new(()),
            reprocess_failures: AtomicU64::new(0),
        }
    }

    /// Create a router with default configuration
    pub fn with_defaults() -> Self {
        Self::new(DlqConfig::default())
    }

    /// The underlying store, for inspection
    pub fn store(&self) -> &Arc<DlqStore> {
        &self.store
    }

    /// Dead letter topic for a source topic
    pub fn dlq_topic_for(&self, topic: &str) -> String {
        format!("{topic}{}", self.config.topic_suffix)
    }

    /// Park a failed message, classifying the error
    ///
    /// Re-routing a message already parked under the same key updates the
    /// stored record (retry_count, last_attempt_at, failure_reason)
    /// without duplicating it.
    pub fn route(&self, message: &Message, error: &DeliveryError, retry_count: u32) -> RouteOutcome {
        let category = ErrorCategory::from_error(error);
        let dlq_topic = self.dlq_topic_for(&message.topic);
        let now = Utc::now();

        let record = DlqMessage {
            id: DlqMessageId::derive(&dlq_topic, message.id),
            message: message.clone(),
            failure_reason: error.to_string(),
            category,
            retry_count,
            first_failed_at: now,
            last_attempt_at: now,
            dlq_topic: dlq_topic.clone(),
        };

        let dlq_message_id = self.store.park(record);

        tracing::warn!(
            topic = %message.topic,
            dlq_topic = %dlq_topic,
            message_id = %message.id,
            category = category.as_str(),
            retry_count = retry_count,
            error = %error,
            "message parked in DLQ"
        );

        if let Some(metrics) = Metrics::get() {
            metrics.record_parked(&dlq_topic, category.as_str());
            metrics.set_dlq_depth(self.store.len());
            if let Some(age) = self.store.oldest_age() {
                metrics.set_dlq_oldest_age(age.as_secs_f64());
            }
        }

        RouteOutcome {
            retry_eligible: category == ErrorCategory::Transient,
            dlq_message_id,
        }
    }

    /// Start the background monitor task
    ///
    /// The monitor keeps depth and oldest-age gauges fresh for alerting
    /// and logs when messages sit parked. Idempotent: a second call while
    /// running is a no-op.
    pub fn start(&self) {
        let mut monitor = self.monitor.lock();
        if monitor.is_some() {
            return;
        }

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let store = Arc::clone(&self.store);
        let interval = self.config.monitor_interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let depth = store.len();
                        if let Some(metrics) = Metrics::get() {
                            metrics.set_dlq_depth(depth);
                            metrics.set_dlq_oldest_age(
                                store.oldest_age().map(|a| a.as_secs_f64()).unwrap_or(0.0),
                            );
                        }
                        if depth > 0 {
                            tracing::debug!(
                                depth = depth,
                                oldest_age_secs = store
                                    .oldest_age()
                                    .map(|a| a.as_secs())
                                    .unwrap_or(0),
                                "DLQ monitor tick"
                            );
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });

        *monitor = Some((shutdown_tx, handle));
        tracing::info!(interval_secs = interval.as_secs(), "DLQ monitor started");
    }

    /// Stop the monitor, draining any in-flight reprocessing first
    pub async fn stop(&self) {
        // Wait for an in-flight reprocessing pass to finish
        let _gate = self.reprocess_gate.lock().await;

        let task = self.monitor.lock().take();
        if let Some((shutdown_tx, handle)) = task {
            let _ = shutdown_tx.send(true);
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "DLQ monitor task failed during shutdown");
            }
        }

        let pending = self.store.len();
        if pending > 0 {
            tracing::warn!(
                pending = pending,
                parked_total = self.store.parked_total(),
                dropped_total = self.store.dropped_total(),
                "DLQ stopped with unprocessed messages"
            );
        }
    }

    /// Republish up to `limit` messages parked on `dlq_topic`
    ///
    /// Each message goes back through the publisher with an incremented
    /// retry count. Success removes the record; failure re-parks it with
    /// updated metadata - never silently dropped.
    pub async fn reprocess_dlq(
        &self,
        republisher: &dyn Republisher,
        dlq_topic: &str,
        limit: usize,
    ) -> ReprocessReport {
        let _gate = self.reprocess_gate.lock().await;

        let batch = self.store.take_for_topic(dlq_topic, limit);
        let mut report = ReprocessReport::default();

        for mut record in batch {
            let next_count = record.retry_count + 1;
            let delivered = republisher
                .republish(record.message.clone(), next_count)
                .await;

            match delivered {
                Ok(true) => {
                    report.reprocessed += 1;
                    tracing::info!(
                        dlq_topic = %dlq_topic,
                        message_id = %record.message.id,
                        retry_count = next_count,
                        "DLQ message reprocessed"
                    );
                    if let Some(metrics) = Metrics::get() {
                        metrics.record_reprocessed(dlq_topic, "reprocessed");
                    }
                }
                Ok(false) | Err(_) => {
                    let reason = match delivered {
                        Err(e) => e.to_string(),
                        _ => "redelivery failed".to_string(),
                    };
                    record.retry_count = next_count;
                    record.last_attempt_at = Utc::now();
                    record.failure_reason = reason.clone();
                    self.store.park(record);
                    self.reprocess_failures.fetch_add(1, Ordering::Relaxed);
                    report.failed += 1;
                    report.errors.push(reason);
                    if let Some(metrics) = Metrics::get() {
                        metrics.record_reprocessed(dlq_topic, "reparked");
                    }
                }
            }
        }

        if let Some(metrics) = Metrics::get() {
            metrics.set_dlq_depth(self.store.len());
        }

        report
    }

    /// Counter snapshot
    pub fn metrics(&self) -> DlqMetrics {
        DlqMetrics {
            depth: self.store.len(),
            parked_total: self.store.parked_total(),
            dropped_total: self.store.dropped_total(),
            reprocess_failures: self.reprocess_failures.load(Ordering::Relaxed),
        }
    }

    /// Summary of DLQ state for alerting
    pub fn summary(&self) -> DlqSummary {
        DlqSummary {
            depth: self.store.len(),
            by_topic: self.store.counts_by_topic(),
            by_category: self.store.counts_by_category(),
            oldest_age: self.store.oldest_age(),
            reprocess_failures: self.reprocess_failures.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn make_message(topic: &str) -> Message {
        Message::new(topic, Bytes::from_static(b"{}"))
    }

    #[test]
    fn classification_poison_vs_transient() {
        assert_eq!(
            ErrorCategory::from_error(&DeliveryError::Transient("x".into())),
            ErrorCategory::Transient
        );
        assert_eq!(
            ErrorCategory::from_error(&DeliveryError::CircuitOpen("c".into())),
            ErrorCategory::Transient
        );
        assert_eq!(
            ErrorCategory::from_error(&DeliveryError::Timeout(100)),
            ErrorCategory::Transient
        );
        assert_eq!(
            ErrorCategory::from_error(&DeliveryError::Terminal("x".into())),
            ErrorCategory::Poison
        );
    }

    #[test]
    fn route_parks_with_derived_key() {
        let router = DeadLetterRouter::with_defaults();
        let msg = make_message("orders");

        let outcome = router.route(&msg, &DeliveryError::Transient("reset".into()), 3);

        assert!(outcome.retry_eligible);
        assert_eq!(router.store().len(), 1);
        let record = router.store().get(&outcome.dlq_message_id).unwrap();
        assert_eq!(record.dlq_topic, "orders.dlq");
        assert_eq!(record.retry_count, 3);
        assert_eq!(record.category, ErrorCategory::Transient);
    }

    #[test]
    fn routing_twice_is_idempotent() {
        let router = DeadLetterRouter::with_defaults();
        let msg = make_message("orders");

        let first = router.route(&msg, &DeliveryError::Transient("reset".into()), 1);
        let before = router.store().get(&first.dlq_message_id).unwrap();

        let second = router.route(&msg, &DeliveryError::Transient("refused".into()), 2);

        assert_eq!(first.dlq_message_id, second.dlq_message_id);
        assert_eq!(router.store().len(), 1);

        let after = router.store().get(&second.dlq_message_id).unwrap();
        assert_eq!(after.retry_count, 2);
        assert_eq!(after.failure_reason, "transient failure: refused");
        assert!(after.last_attempt_at >= before.last_attempt_at);
        assert_eq!(after.first_failed_at, before.first_failed_at);
    }

    #[test]
    fn terminal_error_is_not_retry_eligible() {
        let router = DeadLetterRouter::with_defaults();
        let msg = make_message("orders");

        let outcome = router.route(&msg, &DeliveryError::Terminal("oversized".into()), 0);

        assert!(!outcome.retry_eligible);
        let record = router.store().get(&outcome.dlq_message_id).unwrap();
        assert_eq!(record.category, ErrorCategory::Poison);
    }

    #[test]
    fn store_capacity_evicts_oldest() {
        let store = DlqStore::new(2);
        for i in 0..3 {
            let msg = make_message("t");
            let dlq_topic = "t.dlq".to_string();
            store.park(DlqMessage {
                id: DlqMessageId::derive(&dlq_topic, msg.id),
                message: msg,
                failure_reason: format!("e{i}"),
                category: ErrorCategory::Transient,
                retry_count: 0,
                first_failed_at: Utc::now() + chrono::Duration::milliseconds(i),
                last_attempt_at: Utc::now(),
                dlq_topic,
            });
        }

        assert_eq!(store.len(), 2);
        assert_eq!(store.parked_total(), 3);
        assert_eq!(store.dropped_total(), 1);
    }

    #[test]
    fn take_for_topic_returns_oldest_first() {
        let store = DlqStore::new(100);
        let mut ids = Vec::new();
        for i in 0..3 {
            let msg = make_message("t");
            ids.push(msg.id);
            let dlq_topic = "t.dlq".to_string();
            store.park(DlqMessage {
                id: DlqMessageId::derive(&dlq_topic, msg.id),
                message: msg,
                failure_reason: "e".into(),
                category: ErrorCategory::Transient,
                retry_count: 0,
                first_failed_at: Utc::now() + chrono::Duration::milliseconds(i),
                last_attempt_at: Utc::now(),
                dlq_topic,
            });
        }

        let taken = store.take_for_topic("t.dlq", 2);
        assert_eq!(taken.len(), 2);
        assert_eq!(taken[0].message.id, ids[0]);
        assert_eq!(taken[1].message.id, ids[1]);
        assert_eq!(store.len(), 1);

        // Other topics untouched
        assert!(store.take_for_topic("other.dlq", 10).is_empty());
    }

    #[test]
    fn take_for_topic_breaks_timestamp_ties_by_key() {
        let store = DlqStore::new(100);
        let now = Utc::now();
        for _ in 0..2 {
            let msg = make_message("t");
            let dlq_topic = "t.dlq".to_string();
            store.park(DlqMessage {
                id: DlqMessageId::derive(&dlq_topic, msg.id),
                message: msg,
                failure_reason: "e".into(),
                category: ErrorCategory::Transient,
                retry_count: 0,
                first_failed_at: now,
                last_attempt_at: now,
                dlq_topic,
            });
        }

        // Identical timestamps fall back to key order
        let taken = store.take_for_topic("t.dlq", 10);
        assert_eq!(taken.len(), 2);
        assert!(taken[0].id < taken[1].id);
    }

    #[test]
    fn purge_older_than_removes_aged_records() {
        let store = DlqStore::new(100);
        let msg = make_message("t");
        let dlq_topic = "t.dlq".to_string();
        store.park(DlqMessage {
            id: DlqMessageId::derive(&dlq_topic, msg.id),
            message: msg,
            failure_reason: "e".into(),
            category: ErrorCategory::Poison,
            retry_count: 0,
            first_failed_at: Utc::now() - chrono::Duration::hours(2),
            last_attempt_at: Utc::now() - chrono::Duration::hours(2),
            dlq_topic,
        });

        assert_eq!(store.purge_older_than(Duration::from_secs(3600)), 1);
        assert!(store.is_empty());
    }

    /// Republisher that succeeds for the first N calls, then fails
    struct PartialRepublisher {
        calls: std::sync::atomic::AtomicU32,
        successes: u32,
        seen_counts: Mutex<Vec<u32>>,
    }

    #[async_trait]
    impl Republisher for PartialRepublisher {
        async fn republish(&self, _message: Message, retry_count: u32) -> Result<bool> {
            self.seen_counts.lock().push(retry_count);
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(n < self.successes)
        }
    }

    #[tokio::test]
    async fn reprocess_removes_successes_and_reparks_failures() {
        let router = DeadLetterRouter::with_defaults();
        for _ in 0..10 {
            let msg = make_message("orders");
            router.route(&msg, &DeliveryError::Transient("reset".into()), 2);
        }

        let republisher = PartialRepublisher {
            calls: std::sync::atomic::AtomicU32::new(0),
            successes: 7,
            seen_counts: Mutex::new(Vec::new()),
        };

        let report = router.reprocess_dlq(&republisher, "orders.dlq", 10).await;

        assert_eq!(report.reprocessed, 7);
        assert_eq!(report.failed, 3);
        assert_eq!(report.errors.len(), 3);
        assert_eq!(router.store().len(), 3);

        // Every redelivery carried the incremented counter
        assert!(republisher.seen_counts.lock().iter().all(|&c| c == 3));

        // Re-parked records carry updated metadata
        let summary = router.summary();
        assert_eq!(summary.depth, 3);
        assert_eq!(summary.reprocess_failures, 3);
        for record in router.store().take_for_topic("orders.dlq", 10) {
            assert_eq!(record.retry_count, 3);
            assert_eq!(record.failure_reason, "redelivery failed");
        }
    }

    #[tokio::test]
    async fn reprocess_respects_limit() {
        let router = DeadLetterRouter::with_defaults();
        for _ in 0..5 {
            let msg = make_message("orders");
            router.route(&msg, &DeliveryError::Transient("reset".into()), 0);
        }

        let republisher = PartialRepublisher {
            calls: std::sync::atomic::AtomicU32::new(0),
            successes: 100,
            seen_counts: Mutex::new(Vec::new()),
        };

        let report = router.reprocess_dlq(&republisher, "orders.dlq", 2).await;

        assert_eq!(report.reprocessed, 2);
        assert_eq!(router.store().len(), 3);
    }

    #[tokio::test]
    async fn start_stop_monitor() {
        let router = DeadLetterRouter::new(DlqConfig {
            monitor_interval: Duration::from_millis(5),
            ..DlqConfig::default()
        });

        router.start();
        // Second start is a no-op
        router.start();

        tokio::time::sleep(Duration::from_millis(15)).await;
        router.stop().await;

        // Stop again is harmless
        router.stop().await;
    }

    #[test]
    fn summary_reports_breakdown() {
        let router = DeadLetterRouter::with_defaults();
        router.route(
            &make_message("orders"),
            &DeliveryError::Transient("x".into()),
            0,
        );
        router.route(
            &make_message("payments"),
            &DeliveryError::Terminal("y".into()),
            0,
        );

        let summary = router.summary();
        assert_eq!(summary.depth, 2);
        assert_eq!(summary.by_topic.get("orders.dlq"), Some(&1));
        assert_eq!(summary.by_topic.get("payments.dlq"), Some(&1));
        assert_eq!(summary.by_category.get("transient"), Some(&1));
        assert_eq!(summary.by_category.get("poison"), Some(&1));
        assert!(summary.oldest_age.is_some());
    }
}
