//! End-to-end delivery pipeline tests
//!
//! Exercises the full stack over the in-memory backend:
//! - schema gate -> circuit breaker -> retry -> DLQ -> reprocess
//! - transactional batches with all-or-nothing visibility
//! - zero-copy: `Bytes` payload survives publish and consume unchanged

#![allow(clippy::unwrap_used, clippy::expect_used)]

use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use varma_delivery::{
    BackendAdapter, CircuitBreakerConfig, CircuitState, CompatibilityMode, DeliveryError,
    InMemoryAdapter, MemorySchemaRegistry, Message, Publisher, RetryPolicy, SchemaRegistry,
    SchemaValidator, SchemaValidatorConfig, TransactionCoordinator,
};

const ORDER_SCHEMA: &str = r#"{
    "type": "object",
    "properties": {
        "order_id": {"type": "string"},
        "amount": {"type": "number"}
    },
    "required": ["order_id", "amount"]
}"#;

fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_retries: 3,
        base_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(5),
        jitter_fraction: 0.0,
    }
}

async fn validated_publisher(adapter: Arc<InMemoryAdapter>) -> Publisher {
    let registry = Arc::new(MemorySchemaRegistry::new());
    let validator = Arc::new(SchemaValidator::new(
        Arc::clone(&registry) as Arc<dyn SchemaRegistry>
    ));
    validator
        .register_schema("orders", ORDER_SCHEMA, "JSON")
        .await
        .unwrap();

    Publisher::builder(adapter)
        .validator(validator)
        .retry_policy(fast_retry())
        // Keep the breaker out of the way; circuit behavior has its own test
        .circuit_config(CircuitBreakerConfig {
            failure_threshold: 1_000,
            ..CircuitBreakerConfig::default()
        })
        .build()
}

// ============================================================================
// Happy path and validation gate
// ============================================================================

#[tokio::test]
async fn valid_event_flows_to_the_backend() {
    let adapter = Arc::new(InMemoryAdapter::with_partitions(1));
    let publisher = validated_publisher(Arc::clone(&adapter)).await;

    let delivered = publisher
        .publish(
            "order.created",
            r#"{"order_id": "o-1", "amount": 99.5}"#.as_bytes().to_vec(),
            Some("corr-1"),
            "orders",
            Some("customer-7"),
        )
        .await
        .unwrap();
    assert!(delivered);

    let consumed = adapter
        .consume(&["orders".to_string()], Duration::from_millis(100))
        .await
        .unwrap();
    assert_eq!(consumed.len(), 1);
    assert_eq!(consumed[0].key.as_deref(), Some("customer-7"));
    assert_eq!(
        consumed[0].payload,
        Bytes::from(r#"{"order_id": "o-1", "amount": 99.5}"#)
    );
}

#[tokio::test]
async fn invalid_event_is_rejected_before_delivery() {
    let adapter = Arc::new(InMemoryAdapter::new());
    let publisher = validated_publisher(Arc::clone(&adapter)).await;

    let err = publisher
        .publish(
            "order.created",
            r#"{"amount": 99.5}"#.as_bytes().to_vec(),
            None,
            "orders",
            None,
        )
        .await
        .unwrap_err();

    match err {
        DeliveryError::Validation(reason) => assert!(reason.contains("order_id")),
        other => panic!("expected validation error, got {other:?}"),
    }
    assert_eq!(adapter.topic_len("orders"), 0);
    assert!(publisher.dlq().store().is_empty());
}

#[tokio::test]
async fn schema_evolution_applies_to_subsequent_publishes() {
    let registry = Arc::new(MemorySchemaRegistry::new());
    let validator = Arc::new(SchemaValidator::with_config(
        Arc::clone(&registry) as Arc<dyn SchemaRegistry>,
        SchemaValidatorConfig {
            compatibility: CompatibilityMode::Backward,
            ..Default::default()
        },
    ));
    validator
        .register_schema("orders", ORDER_SCHEMA, "JSON")
        .await
        .unwrap();

    let adapter = Arc::new(InMemoryAdapter::new());
    let publisher = Publisher::builder(adapter.clone())
        .validator(Arc::clone(&validator))
        .retry_policy(fast_retry())
        .build();

    // v2 adds an optional field and an enum constraint
    validator
        .register_schema(
            "orders",
            r#"{
                "type": "object",
                "properties": {
                    "order_id": {"type": "string"},
                    "amount": {"type": "number"},
                    "status": {"type": "string", "enum": ["new", "paid"]}
                },
                "required": ["order_id", "amount"]
            }"#,
            "JSON",
        )
        .await
        .unwrap();

    // Registration invalidated the cache: the v2 enum is enforced now
    let err = publisher
        .publish(
            "order.created",
            r#"{"order_id": "o-1", "amount": 1, "status": "lost"}"#
                .as_bytes()
                .to_vec(),
            None,
            "orders",
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, DeliveryError::Validation(_)));

    let delivered = publisher
        .publish(
            "order.created",
            r#"{"order_id": "o-1", "amount": 1, "status": "paid"}"#
                .as_bytes()
                .to_vec(),
            None,
            "orders",
            None,
        )
        .await
        .unwrap();
    assert!(delivered);
}

// ============================================================================
// Failure handling: retry, DLQ, reprocess
// ============================================================================

#[tokio::test]
async fn outage_parks_messages_and_reprocess_drains_them() {
    let adapter = Arc::new(InMemoryAdapter::with_partitions(1));
    let publisher = validated_publisher(Arc::clone(&adapter)).await;

    // Every attempt fails: 3 messages x (1 try + 3 retries)
    adapter.inject_transient_failures(12, "broker down");

    for i in 0..3 {
        let delivered = publisher
            .publish(
                "order.created",
                format!(r#"{{"order_id": "o-{i}", "amount": 1}}"#).into_bytes(),
                None,
                "orders",
                None,
            )
            .await
            .unwrap();
        assert!(!delivered);
    }

    let summary = publisher.dlq().summary();
    assert_eq!(summary.depth, 3);
    assert_eq!(summary.by_topic.get("orders.dlq"), Some(&3));
    assert_eq!(summary.by_category.get("transient"), Some(&3));

    // Backend healthy again: one reprocessing pass drains the queue
    let report = publisher.reprocess_dlq("orders.dlq", 10).await;
    assert_eq!(report.reprocessed, 3);
    assert_eq!(report.failed, 0);
    assert!(publisher.dlq().store().is_empty());
    assert_eq!(adapter.topic_len("orders"), 3);
}

#[tokio::test]
async fn partial_reprocess_reparks_failures_with_incremented_counts() {
    let adapter = Arc::new(InMemoryAdapter::new());
    let publisher = Publisher::builder(adapter.clone())
        .retry_policy(RetryPolicy {
            max_retries: 0,
            ..fast_retry()
        })
        .circuit_config(CircuitBreakerConfig {
            failure_threshold: 1_000,
            ..CircuitBreakerConfig::default()
        })
        .build();

    adapter.inject_transient_failures(10, "down");
    for _ in 0..10 {
        let r = publisher
            .publish_message(
                Message::new("orders", Bytes::from_static(b"{}")),
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        assert!(!r.delivered);
    }
    assert_eq!(publisher.dlq().store().len(), 10);

    // 3 of the redeliveries hit lingering failures and are re-parked
    adapter.inject_transient_failures(3, "still down");
    let report = publisher.reprocess_dlq("orders.dlq", 10).await;

    assert_eq!(report.reprocessed, 7);
    assert_eq!(report.failed, 3);
    assert_eq!(publisher.dlq().store().len(), 3);
    assert_eq!(adapter.topic_len("orders"), 7);

    for record in publisher.dlq().store().take_for_topic("orders.dlq", 10) {
        assert_eq!(record.retry_count, 1); // 0 at park, +1 for the reprocess
    }
}

// ============================================================================
// Circuit breaker behavior under sustained failure
// ============================================================================

#[tokio::test]
async fn circuit_opens_on_sustained_failure_and_recovers_via_probes() {
    let adapter = Arc::new(InMemoryAdapter::new());
    let publisher = Publisher::builder(adapter.clone())
        .retry_policy(RetryPolicy {
            max_retries: 0,
            ..fast_retry()
        })
        .circuit_config(CircuitBreakerConfig {
            failure_threshold: 3,
            success_threshold: 2,
            reset_timeout: Duration::from_millis(30),
            half_open_max_probes: 1,
        })
        .build();

    adapter.inject_transient_failures(3, "down");
    let message = || Message::new("orders", Bytes::from_static(b"{}"));
    for _ in 0..3 {
        assert!(
            !publisher
                .publish_message(message(), Duration::from_secs(5))
                .await
                .unwrap()
                .delivered
        );
    }
    assert_eq!(
        publisher.breakers().state("in-memory"),
        Some(CircuitState::Open)
    );

    // While open, publishes are rejected without touching the adapter
    let before = adapter.topic_len("orders");
    assert!(
        !publisher
            .publish_message(message(), Duration::from_secs(5))
            .await
            .unwrap()
            .delivered
    );
    assert_eq!(adapter.topic_len("orders"), before);

    // After the reset timeout, probes succeed and the circuit closes
    tokio::time::sleep(Duration::from_millis(40)).await;
    for _ in 0..2 {
        assert!(
            publisher
                .publish_message(message(), Duration::from_secs(5))
                .await
                .unwrap()
                .delivered
        );
    }
    assert_eq!(
        publisher.breakers().state("in-memory"),
        Some(CircuitState::Closed)
    );
}

// ============================================================================
// Transactions
// ============================================================================

#[tokio::test]
async fn committed_batch_is_atomically_visible() {
    let adapter = Arc::new(InMemoryAdapter::with_partitions(1));
    let coordinator = TransactionCoordinator::new(Arc::clone(&adapter) as Arc<dyn BackendAdapter>);

    coordinator.init_transactions().unwrap();
    coordinator.begin_transaction().await.unwrap();
    for i in 0..3 {
        coordinator
            .send_transactional(Message::new(
                "orders",
                Bytes::from(format!(r#"{{"order_id": "o-{i}"}}"#)),
            ))
            .unwrap();
    }

    // Nothing visible before commit
    let before = adapter
        .consume(&["orders".to_string()], Duration::from_millis(20))
        .await
        .unwrap();
    assert!(before.is_empty());

    coordinator.commit_transaction().await.unwrap();
    let after = adapter
        .consume(&["orders".to_string()], Duration::from_millis(100))
        .await
        .unwrap();
    assert_eq!(after.len(), 3);
}

#[tokio::test]
async fn aborted_batch_never_becomes_visible() {
    let adapter = Arc::new(InMemoryAdapter::new());
    let coordinator = TransactionCoordinator::new(Arc::clone(&adapter) as Arc<dyn BackendAdapter>);

    coordinator.init_transactions().unwrap();
    coordinator.begin_transaction().await.unwrap();
    coordinator
        .send_transactional(Message::new("orders", Bytes::from_static(b"{}")))
        .unwrap();
    coordinator.abort_transaction().await.unwrap();

    let consumed = adapter
        .consume(&["orders".to_string()], Duration::from_millis(20))
        .await
        .unwrap();
    assert!(consumed.is_empty());

    // The coordinator is immediately reusable
    coordinator.begin_transaction().await.unwrap();
    coordinator
        .send_transactional(Message::new("orders", Bytes::from_static(b"{}")))
        .unwrap();
    coordinator.commit_transaction().await.unwrap();
    assert_eq!(adapter.topic_len("orders"), 1);
}

// ============================================================================
// Zero-copy verification
// ============================================================================

#[tokio::test]
async fn payload_survives_publish_and_consume_without_copy() {
    let payload = Bytes::from(vec![42u8; 10_000]);
    let original_ptr = payload.as_ptr();

    let adapter = Arc::new(InMemoryAdapter::with_partitions(1));
    let publisher = Publisher::builder(adapter.clone())
        .retry_policy(fast_retry())
        .build();

    let result = publisher
        .publish_message(
            Message::new("blobs", payload),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
    assert!(result.delivered);

    let consumed = adapter
        .consume(&["blobs".to_string()], Duration::from_millis(100))
        .await
        .unwrap();
    assert_eq!(consumed.len(), 1);
    // Bytes is Arc-backed: the broker log and the consumer share the
    // original allocation
    assert_eq!(consumed[0].payload.as_ptr(), original_ptr);
    assert_eq!(consumed[0].payload.len(), 10_000);
}

// ============================================================================
// Shutdown
// ============================================================================

#[tokio::test]
async fn close_drains_and_shuts_down() {
    let adapter = Arc::new(InMemoryAdapter::new());
    let publisher = Publisher::builder(adapter.clone())
        .retry_policy(fast_retry())
        .build();
    publisher.start();

    publisher
        .publish_message(
            Message::new("orders", Bytes::from_static(b"{}")),
            Duration::from_secs(5),
        )
        .await
        .unwrap();

    publisher.close().await.unwrap();
}
