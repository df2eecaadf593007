//! Publish orchestration
//!
//! [`Publisher`] wires the delivery pipeline together under one caller
//! deadline: the schema gate runs first and rejects caller mistakes
//! synchronously; delivery then goes through the backend's circuit
//! breaker, which admits or rejects the whole retried send and records
//! one outcome per publish; messages that exhaust retries or fail
//! terminally are parked in the DLQ and reported as `Ok(false)` - an
//! accepted message is never silently dropped.

use crate::error::{DeliveryError, ErrorClass, Result};
use crate::metrics::Metrics;
use crate::resilience::{
    CircuitBreakerConfig, CircuitBreakerRegistry, DeadLetterRouter, DlqConfig, DlqMessageId,
    ReprocessReport, Republisher, RetryExecutor, RetryPolicy,
};
use crate::schema::SchemaValidator;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};
use varma_core::{BackendAdapter, Message, SendAck};

/// Outcome of one publish call
#[derive(Debug, Clone)]
pub struct PublishResult {
    /// Whether the message reached the backend
    pub delivered: bool,
    /// Broker placement ack, on delivery
    pub ack: Option<SendAck>,
    /// Delivery attempts made, including the first try
    pub attempts: u32,
    /// Wall-clock delivery time including retries
    pub latency_ms: u64,
    /// DLQ record key, when the message was parked
    pub dlq_message_id: Option<DlqMessageId>,
}

/// Telemetry snapshot of a publisher
#[derive(Debug, Clone)]
pub struct PublisherMetrics {
    /// Retry attempts consumed across all publishes
    pub retries_total: u64,
    /// Publishes that recovered after at least one retry
    pub recovered_total: u64,
    /// DLQ counters
    pub dlq: crate::resilience::DlqMetrics,
    /// Per-circuit snapshots
    pub circuits: Vec<crate::resilience::CircuitSnapshot>,
}

/// Builder for [`Publisher`]
pub struct PublisherBuilder {
    adapter: Arc<dyn BackendAdapter>,
    validator: Option<Arc<SchemaValidator>>,
    retry_policy: RetryPolicy,
    circuit_config: CircuitBreakerConfig,
    dlq_config: DlqConfig,
    publish_timeout: Duration,
}

impl PublisherBuilder {
    /// Start building a publisher over the given backend
    pub fn new(adapter: Arc<dyn BackendAdapter>) -> Self {
        Self {
            adapter,
            validator: None,
            retry_policy: RetryPolicy::default(),
            circuit_config: CircuitBreakerConfig::default(),
            dlq_config: DlqConfig::default(),
            publish_timeout: Duration::from_secs(30),
        }
    }

    /// Enable the schema validation gate
    pub fn validator(mut self, validator: Arc<SchemaValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    /// Override the retry policy
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Override the default circuit breaker configuration
    pub fn circuit_config(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_config = config;
        self
    }

    /// Override the DLQ configuration
    pub fn dlq_config(mut self, config: DlqConfig) -> Self {
        self.dlq_config = config;
        self
    }

    /// Override the default per-publish deadline
    pub fn publish_timeout(mut self, timeout: Duration) -> Self {
        self.publish_timeout = timeout;
        self
    }

    /// Build the publisher
    pub fn build(self) -> Publisher {
        Publisher {
            adapter: self.adapter,
            validator: self.validator,
            breakers: CircuitBreakerRegistry::new(self.circuit_config),
            retry_policy: self.retry_policy,
            retry: RetryExecutor::new(),
            dlq: Arc::new(DeadLetterRouter::new(self.dlq_config)),
            publish_timeout: self.publish_timeout,
        }
    }
}

/// Reliable publisher over a [`BackendAdapter`]
pub struct Publisher {
    adapter: Arc<dyn BackendAdapter>,
    validator: Option<Arc<SchemaValidator>>,
    breakers: CircuitBreakerRegistry,
    retry_policy: RetryPolicy,
    retry: RetryExecutor,
    dlq: Arc<DeadLetterRouter>,
    publish_timeout: Duration,
}

impl Publisher {
    /// Builder entry point
    pub fn builder(adapter: Arc<dyn BackendAdapter>) -> PublisherBuilder {
        PublisherBuilder::new(adapter)
    }

    /// Start background work (DLQ monitor)
    pub fn start(&self) {
        self.dlq.start();
    }

    /// Publish an event to `topic`
    ///
    /// Convenience wrapper that builds the envelope: `event_type` travels
    /// as a header, `partition_key` becomes the partitioning key. Returns
    /// `Ok(true)` on delivery, `Ok(false)` when the message was parked in
    /// the DLQ, and `Err` for caller mistakes (validation, lifecycle).
    pub async fn publish(
        &self,
        event_type: &str,
        payload: impl Into<Bytes>,
        correlation_id: Option<&str>,
        topic: &str,
        partition_key: Option<&str>,
    ) -> Result<bool> {
        let mut message = Message::new(topic, payload.into()).with_header("event-type", event_type);
        if let Some(key) = partition_key {
            message = message.with_key(key);
        }
        if let Some(id) = correlation_id {
            message = message.with_correlation_id(id);
        }

        let result = self.publish_message(message, self.publish_timeout).await?;
        Ok(result.delivered)
    }

    /// Publish a pre-built message under an explicit deadline
    ///
    /// The deadline covers the whole pipeline: schema validation,
    /// delivery including retries, and DLQ routing. A deadline expiry is
    /// treated like any transient failure: the message is parked in the
    /// DLQ with the attempts made so far, never dropped.
    pub async fn publish_message(
        &self,
        message: Message,
        timeout: Duration,
    ) -> Result<PublishResult> {
        let started = Instant::now();
        let attempts_seen = AtomicU32::new(0);

        match tokio::time::timeout(timeout, self.deliver(&message, started, &attempts_seen)).await
        {
            Ok(result) => result,
            Err(_) => {
                let attempts = attempts_seen.load(Ordering::Relaxed).max(1);
                let error = DeliveryError::Timeout(timeout.as_millis() as u64);
                if let Some(m) = Metrics::get() {
                    m.record_retries(attempts.saturating_sub(1) as u64);
                    m.record_publish_failure(&message.topic, error_label(&error));
                }
                let outcome = self.dlq.route(&message, &error, attempts.saturating_sub(1));
                Ok(PublishResult {
                    delivered: false,
                    ack: None,
                    attempts,
                    latency_ms: started.elapsed().as_millis() as u64,
                    dlq_message_id: Some(outcome.dlq_message_id),
                })
            }
        }
    }

    /// The pipeline body: validation gate, guarded send, DLQ routing
    async fn deliver(
        &self,
        message: &Message,
        started: Instant,
        attempts_seen: &AtomicU32,
    ) -> Result<PublishResult> {
        if let Some(validator) = &self.validator {
            let outcome = validator
                .validate_event(&message.topic, &message.payload)
                .await?;
            if !outcome.is_valid {
                let reason = outcome
                    .reason
                    .unwrap_or_else(|| "payload rejected".to_string());
                tracing::warn!(
                    topic = %message.topic,
                    message_id = %message.id,
                    reason = %reason,
                    "payload failed validation"
                );
                if let Some(m) = Metrics::get() {
                    m.record_publish_failure(&message.topic, "validation");
                }
                return Err(DeliveryError::Validation(reason));
            }
        }

        let (result, attempts) = self.guarded_send(message, attempts_seen).await;

        if let Some(m) = Metrics::get() {
            m.record_retries(attempts.saturating_sub(1) as u64);
        }

        match result {
            Ok(ack) => {
                tracing::debug!(
                    topic = %message.topic,
                    message_id = %message.id,
                    partition = ack.partition,
                    offset = ack.offset,
                    attempts = attempts,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "message delivered"
                );
                if let Some(m) = Metrics::get() {
                    m.record_publish_success(&message.topic, started.elapsed().as_secs_f64());
                }
                Ok(PublishResult {
                    delivered: true,
                    ack: Some(ack),
                    attempts,
                    latency_ms: started.elapsed().as_millis() as u64,
                    dlq_message_id: None,
                })
            }
            Err(e) if e.class() == ErrorClass::Caller => Err(e),
            Err(e) => {
                if let Some(m) = Metrics::get() {
                    m.record_publish_failure(&message.topic, error_label(&e));
                }
                let outcome = self.dlq.route(message, &e, attempts.saturating_sub(1));
                Ok(PublishResult {
                    delivered: false,
                    ack: None,
                    attempts,
                    latency_ms: started.elapsed().as_millis() as u64,
                    dlq_message_id: Some(outcome.dlq_message_id),
                })
            }
        }
    }

    /// Republish parked messages from a dead letter topic
    ///
    /// Delegates to the router with this publisher as the redelivery seam.
    pub async fn reprocess_dlq(&self, dlq_topic: &str, limit: usize) -> ReprocessReport {
        self.dlq.reprocess_dlq(self, dlq_topic, limit).await
    }

    /// The circuit breaker registry, for configuration and overrides
    pub fn breakers(&self) -> &CircuitBreakerRegistry {
        &self.breakers
    }

    /// The dead letter router, for inspection and summaries
    pub fn dlq(&self) -> &Arc<DeadLetterRouter> {
        &self.dlq
    }

    /// The schema validator, when the gate is enabled
    pub fn validator(&self) -> Option<&Arc<SchemaValidator>> {
        self.validator.as_ref()
    }

    /// Retry telemetry: (total retries, runs recovered after retry)
    pub fn retry_stats(&self) -> (u64, u64) {
        (self.retry.retry_total(), self.retry.recovered_total())
    }

    /// Telemetry snapshot across the whole pipeline
    pub fn metrics(&self) -> PublisherMetrics {
        PublisherMetrics {
            retries_total: self.retry.retry_total(),
            recovered_total: self.retry.recovered_total(),
            dlq: self.dlq.metrics(),
            circuits: self.breakers.snapshots(),
        }
    }

    /// Graceful shutdown: drain DLQ work, then close the adapter
    pub async fn close(&self) -> Result<()> {
        self.dlq.stop().await;
        let pending = self.dlq.store().len();
        if pending > 0 {
            tracing::warn!(pending = pending, "closing with messages still parked in DLQ");
        }
        self.adapter
            .shutdown()
            .await
            .map_err(|e| DeliveryError::Shutdown(e.to_string()))
    }

    /// Circuit-guarded retry loop
    ///
    /// The breaker wraps the whole retried send: one admit-or-reject
    /// decision and one recorded outcome per publish, so a single failing
    /// publish cannot burn the failure threshold on its own retries.
    /// Each attempt bumps `attempts_seen` so a caller that abandons the
    /// future still knows how far delivery got.
    async fn guarded_send(
        &self,
        message: &Message,
        attempts_seen: &AtomicU32,
    ) -> (Result<SendAck>, u32) {
        let mut attempts = 0u32;
        let result = self
            .breakers
            .execute(self.adapter.name(), || {
                let attempts = &mut attempts;
                async move {
                    let (result, tries) = self
                        .retry
                        .run_counted(&self.retry_policy, || {
                            attempts_seen.fetch_add(1, Ordering::Relaxed);
                            async move {
                                match self.adapter.send(message).await {
                                    Ok(ack) => Ok(ack),
                                    Err(e) => Err(self.reclassify(e)),
                                }
                            }
                        })
                        .await;
                    *attempts = tries;
                    result
                }
            })
            .await;
        // A breaker rejection never reaches the adapter
        (result, attempts.max(1))
    }

    /// Apply the adapter's error classification override
    fn reclassify(&self, error: DeliveryError) -> DeliveryError {
        let class = self.adapter.classify(&error);
        if class == error.class() {
            return error;
        }
        match class {
            ErrorClass::Retryable => DeliveryError::Transient(error.to_string()),
            ErrorClass::Terminal => DeliveryError::Terminal(error.to_string()),
            ErrorClass::Caller => error,
        }
    }
}

#[async_trait]
impl Republisher for Publisher {
    /// Redeliver a parked message through the guarded send path
    ///
    /// Skips the validation gate (the payload was already admitted once)
    /// and does not route failures back to the DLQ - the router re-parks
    /// them itself so a failed reprocess is never double-counted.
    async fn republish(&self, message: Message, retry_count: u32) -> Result<bool> {
        let started = Instant::now();
        let attempts_seen = AtomicU32::new(0);
        let (result, _attempts) = self.guarded_send(&message, &attempts_seen).await;
        match result {
            Ok(_ack) => {
                tracing::debug!(
                    topic = %message.topic,
                    message_id = %message.id,
                    retry_count = retry_count,
                    "parked message redelivered"
                );
                if let Some(m) = Metrics::get() {
                    m.record_publish_success(&message.topic, started.elapsed().as_secs_f64());
                }
                Ok(true)
            }
            Err(e) if e.class() == ErrorClass::Caller => Err(e),
            Err(e) => {
                tracing::debug!(
                    topic = %message.topic,
                    message_id = %message.id,
                    error = %e,
                    "redelivery failed"
                );
                Ok(false)
            }
        }
    }
}

fn error_label(error: &DeliveryError) -> &'static str {
    match error {
        DeliveryError::Validation(_) => "validation",
        DeliveryError::Compatibility(_) => "compatibility",
        DeliveryError::UnsupportedSchemaType(_) => "unsupported_schema_type",
        DeliveryError::Transient(_) => "transient",
        DeliveryError::Terminal(_) => "terminal",
        DeliveryError::CircuitOpen(_) => "circuit_open",
        DeliveryError::State(_) => "state",
        DeliveryError::Timeout(_) => "timeout",
        DeliveryError::Shutdown(_) => "shutdown",
    }
}
