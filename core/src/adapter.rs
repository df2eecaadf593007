//! Backend adapter trait for VARMA
//!
//! [`BackendAdapter`] defines the boundary between the delivery core and a
//! concrete message broker. The core never encodes broker wire formats; it
//! only calls this interface. Implementations exist per broker (Kafka,
//! Redpanda, HTTP bridge, in-memory).

use crate::error::{DeliveryError, ErrorClass};
use crate::message::{Headers, Message};
use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;

/// Broker acknowledgement for a delivered message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendAck {
    /// Partition the message landed on
    pub partition: i32,
    /// Offset within the partition
    pub offset: i64,
}

/// A message read back from the broker
#[derive(Debug, Clone)]
pub struct RawMessage {
    /// Topic the message was consumed from
    pub topic: String,
    /// Partition it was read from
    pub partition: i32,
    /// Offset within the partition
    pub offset: i64,
    /// Partitioning key, if any
    pub key: Option<String>,
    /// Opaque payload
    pub payload: Bytes,
    /// Headers as stored by the broker
    pub headers: Headers,
    /// Broker-assigned timestamp (unix nanos)
    pub timestamp: i64,
}

/// A committed consumer position
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicOffset {
    /// Topic name
    pub topic: String,
    /// Partition number
    pub partition: i32,
    /// Next offset to consume
    pub offset: i64,
}

/// Async interface to a concrete message broker
///
/// # Implementation Requirements
///
/// - Adapters must be `Send + Sync` for use across async tasks
/// - `send` must not retry internally; retry policy belongs to the core
/// - Errors must be constructed as [`DeliveryError::Transient`] or
///   [`DeliveryError::Terminal`] so the core can route them; brokers with
///   richer error models override [`classify`](BackendAdapter::classify)
/// - Transactional hooks default to a state error for brokers without
///   transaction support
///
/// # Example
///
/// ```ignore
/// use varma_core::{BackendAdapter, DeliveryError, Message, SendAck};
/// use async_trait::async_trait;
///
/// struct HttpBridge {
///     client: reqwest::Client,
///     endpoint: String,
/// }
///
/// #[async_trait]
/// impl BackendAdapter for HttpBridge {
///     fn name(&self) -> &'static str {
///         "http-bridge"
///     }
///
///     async fn send(&self, message: &Message) -> Result<SendAck, DeliveryError> {
///         self.client
///             .post(format!("{}/topics/{}", self.endpoint, message.topic))
///             .body(message.payload.clone())
///             .send()
///             .await
///             .map_err(|e| DeliveryError::Transient(e.to_string()))?;
///         Ok(SendAck { partition: 0, offset: -1 })
///     }
///     # async fn connect(&self, _: &[String]) -> Result<(), DeliveryError> { Ok(()) }
///     # async fn consume(&self, _: &[String], _: std::time::Duration)
///     #     -> Result<Vec<varma_core::RawMessage>, DeliveryError> { Ok(vec![]) }
///     # async fn commit_offsets(&self, _: &[varma_core::TopicOffset])
///     #     -> Result<(), DeliveryError> { Ok(()) }
/// }
/// ```
#[async_trait]
pub trait BackendAdapter: Send + Sync {
    /// Short identifier for logging and metrics ("kafka", "in-memory", ...)
    fn name(&self) -> &'static str;

    /// Establish connectivity to the broker endpoints
    async fn connect(&self, endpoints: &[String]) -> Result<(), DeliveryError>;

    /// Deliver one message, returning the broker's placement ack
    ///
    /// Must not retry internally. A connection-level failure is
    /// `Transient`; a broker rejection of the message itself is `Terminal`.
    async fn send(&self, message: &Message) -> Result<SendAck, DeliveryError>;

    /// Deliver a batch with all-or-nothing visibility where the broker
    /// supports it
    ///
    /// The default delivers sequentially and fails on the first error,
    /// which does NOT give atomic visibility. Adapters backing the
    /// transaction coordinator must override this.
    async fn send_batch(&self, messages: &[Message]) -> Result<Vec<SendAck>, DeliveryError> {
        let mut acks = Vec::with_capacity(messages.len());
        for message in messages {
            acks.push(self.send(message).await?);
        }
        Ok(acks)
    }

    /// Read available messages from the given topics, waiting up to
    /// `timeout` for data
    async fn consume(
        &self,
        topics: &[String],
        timeout: Duration,
    ) -> Result<Vec<RawMessage>, DeliveryError>;

    /// Commit consumer positions
    async fn commit_offsets(&self, offsets: &[TopicOffset]) -> Result<(), DeliveryError>;

    /// Map an error onto the retry classification
    ///
    /// The default follows [`DeliveryError::class`]. Brokers that report,
    /// say, quota errors as transient strings can override this.
    fn classify(&self, error: &DeliveryError) -> ErrorClass {
        error.class()
    }

    /// Open a broker-side transaction
    ///
    /// Default: transactions unsupported.
    async fn begin_transaction(&self, transaction_id: &str) -> Result<(), DeliveryError> {
        Err(DeliveryError::State(format!(
            "backend '{}' does not support transactions (txn {transaction_id})",
            self.name()
        )))
    }

    /// Atomically publish a buffered batch under an open transaction
    ///
    /// All messages become visible to read-committed consumers together,
    /// or none do.
    async fn commit_batch(
        &self,
        transaction_id: &str,
        messages: &[Message],
    ) -> Result<Vec<SendAck>, DeliveryError> {
        let _ = messages;
        Err(DeliveryError::State(format!(
            "backend '{}' does not support transactions (txn {transaction_id})",
            self.name()
        )))
    }

    /// Mark an open transaction aborted so read-committed consumers skip it
    async fn abort_transaction(&self, transaction_id: &str) -> Result<(), DeliveryError> {
        Err(DeliveryError::State(format!(
            "backend '{}' does not support transactions (txn {transaction_id})",
            self.name()
        )))
    }

    /// Graceful shutdown: flush pending data, close connections
    ///
    /// The default is a no-op for adapters without cleanup.
    async fn shutdown(&self) -> Result<(), DeliveryError> {
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Minimal adapter for exercising trait defaults
    struct CountingAdapter {
        sends: AtomicU32,
    }

    #[async_trait]
    impl BackendAdapter for CountingAdapter {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn connect(&self, _endpoints: &[String]) -> Result<(), DeliveryError> {
            Ok(())
        }

        async fn send(&self, _message: &Message) -> Result<SendAck, DeliveryError> {
            let n = self.sends.fetch_add(1, Ordering::SeqCst);
            Ok(SendAck {
                partition: 0,
                offset: n as i64,
            })
        }

        async fn consume(
            &self,
            _topics: &[String],
            _timeout: Duration,
        ) -> Result<Vec<RawMessage>, DeliveryError> {
            Ok(vec![])
        }

        async fn commit_offsets(&self, _offsets: &[TopicOffset]) -> Result<(), DeliveryError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn default_send_batch_delivers_sequentially() {
        let adapter = CountingAdapter {
            sends: AtomicU32::new(0),
        };
        let messages = vec![
            Message::new("t", Bytes::new()),
            Message::new("t", Bytes::new()),
            Message::new("t", Bytes::new()),
        ];

        let acks = adapter.send_batch(&messages).await.unwrap();

        assert_eq!(acks.len(), 3);
        assert_eq!(acks[2].offset, 2);
        assert_eq!(adapter.sends.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn default_transaction_hooks_report_state_error() {
        let adapter = CountingAdapter {
            sends: AtomicU32::new(0),
        };

        let err = adapter.begin_transaction("txn-1").await.unwrap_err();
        assert!(matches!(err, DeliveryError::State(_)));

        let err = adapter.abort_transaction("txn-1").await.unwrap_err();
        assert!(matches!(err, DeliveryError::State(_)));
    }

    #[tokio::test]
    async fn default_classify_follows_taxonomy() {
        let adapter = CountingAdapter {
            sends: AtomicU32::new(0),
        };
        assert_eq!(
            adapter.classify(&DeliveryError::Transient("x".into())),
            ErrorClass::Retryable
        );
        assert_eq!(
            adapter.classify(&DeliveryError::Terminal("x".into())),
            ErrorClass::Terminal
        );
    }

    #[tokio::test]
    async fn trait_is_object_safe() {
        let adapter: std::sync::Arc<dyn BackendAdapter> = std::sync::Arc::new(CountingAdapter {
            sends: AtomicU32::new(0),
        });
        assert_eq!(adapter.name(), "counting");
        assert!(adapter.shutdown().await.is_ok());
    }
}
