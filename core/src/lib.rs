//! varma-core - Core types for the VARMA delivery core
//!
//! This crate provides the foundational types shared between the VARMA
//! delivery engine and external backend adapters:
//!
//! - [`Message`] - the broker-agnostic event envelope (zero-copy payload)
//! - [`BackendAdapter`] trait - async interface to a concrete broker
//! - [`DeliveryError`] - the error taxonomy driving retry/DLQ decisions
//! - [`ErrorClass`] - retryable / terminal / caller classification
//!
//! # Why this crate exists
//!
//! Concrete broker adapters (Kafka, Redpanda, HTTP bridges) need to
//! implement [`BackendAdapter`] and construct [`Message`] values. Without
//! `varma-core` they would depend on the full delivery engine, and the
//! engine might in turn want to optionally ship one of those adapters,
//! creating a cyclic dependency. Extracting the boundary types here breaks
//! the cycle:
//!
//! ```text
//! varma-core ◄── varma-delivery
//!     ▲
//!     └────────── external adapter crates
//! ```

#![deny(unsafe_code)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::panic)]
#![warn(missing_docs)]

mod adapter;
mod error;
/// The broker-agnostic event envelope
pub mod message;

pub use adapter::{BackendAdapter, RawMessage, SendAck, TopicOffset};
pub use error::{DeliveryError, ErrorClass};
pub use message::{Headers, Message, MessageId};
