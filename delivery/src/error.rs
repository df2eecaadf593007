//! Error types for the delivery engine

// Re-export the taxonomy from varma-core; it is the single error currency
// across the publish path, adapters, and the DLQ.
pub use varma_core::{DeliveryError, ErrorClass};

/// Result type alias for delivery operations
pub type Result<T> = std::result::Result<T, DeliveryError>;
