//! Built-in backend adapters
//!
//! The delivery core talks to brokers exclusively through
//! [`varma_core::BackendAdapter`]. Two implementations ship in-tree: an
//! in-memory broker simulation and an HTTP producer bridge. Broker-native
//! adapters (Kafka, Redpanda) live in their own crates.

mod http;
mod memory;

pub use http::{HttpBridgeAdapter, HttpBridgeConfig};
pub use memory::InMemoryAdapter;
