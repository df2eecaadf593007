//! VARMA delivery - reliable event delivery over pluggable backends
//!
//! The delivery core wraps any [`varma_core::BackendAdapter`] with the
//! machinery production publishing needs:
//!
//! - **Schema gate**: payloads validated against a versioned registry
//!   before any delivery work ([`schema`])
//! - **Resilience**: circuit breakers, bounded retry with backoff, and
//!   dead letter capture ([`resilience`])
//! - **Orchestration**: [`Publisher`] composes the pipeline; an accepted
//!   message is delivered, parked, or rejected - never silently dropped
//! - **Transactions**: all-or-nothing batch publishing through
//!   [`TransactionCoordinator`]
//!
//! # Quick start
//!
//! ```
//! use std::sync::Arc;
//! use varma_delivery::{InMemoryAdapter, Publisher};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), varma_delivery::DeliveryError> {
//! let adapter = Arc::new(InMemoryAdapter::new());
//! let publisher = Publisher::builder(adapter).build();
//!
//! let delivered = publisher
//!     .publish(
//!         "order.created",
//!         r#"{"order_id": "o-1"}"#.as_bytes().to_vec(),
//!         None,
//!         "orders",
//!         Some("customer-7"),
//!     )
//!     .await?;
//! assert!(delivered);
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::panic)]

pub mod backend;
pub mod error;
pub mod metrics;
pub mod publish;
pub mod resilience;
pub mod schema;
pub mod transaction;

pub use backend::{HttpBridgeAdapter, HttpBridgeConfig, InMemoryAdapter};
pub use error::{DeliveryError, ErrorClass, Result};
pub use metrics::Metrics;
pub use publish::{PublishResult, Publisher, PublisherBuilder, PublisherMetrics};
pub use resilience::{
    CircuitBreakerConfig, CircuitBreakerRegistry, CircuitState, DeadLetterRouter, DlqConfig,
    DlqMetrics, DlqSummary, ReprocessReport, Republisher, RetryPolicy,
};
pub use schema::{
    CompatibilityMode, FallbackPolicy, MemorySchemaRegistry, SchemaRegistry, SchemaValidator,
    SchemaValidatorConfig, ValidationOutcome,
};
pub use transaction::{TransactionCoordinator, TxnState};

// Re-export the core envelope types callers need at the API surface
pub use varma_core::{BackendAdapter, Message, MessageId, RawMessage, SendAck, TopicOffset};
