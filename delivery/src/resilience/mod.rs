//! Resilience primitives for the publish path
//!
//! Composable fault-tolerance building blocks:
//! - **CircuitBreakerRegistry**: named breakers, fail fast when a backend
//!   is unhealthy
//! - **RetryExecutor**: bounded exponential backoff with jitter
//! - **DeadLetterRouter**: capture undeliverable messages for later
//!   reprocessing

mod circuit_breaker;
mod dlq;
mod retry;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitSnapshot, CircuitState,
};
pub use dlq::{
    DeadLetterRouter, DlqConfig, DlqMessage, DlqMessageId, DlqMetrics, DlqStore, DlqSummary,
    ErrorCategory, ReprocessReport, RouteOutcome, Republisher,
};
pub use retry::{RetryExecutor, RetryPolicy};
