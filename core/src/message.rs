//! The broker-agnostic event envelope
//!
//! [`Message`] is the universal envelope that flows through the delivery
//! core. It is broker-agnostic and uses `Bytes` for zero-copy payload
//! handling: cloning a message shares the underlying payload allocation,
//! so DLQ capture and transactional buffering never copy payload bytes.
//!
//! Headers are an ordered list of string pairs (broker header semantics),
//! inlined up to four entries via `SmallVec` since most messages carry a
//! correlation id and little else.

use bytes::Bytes;
use smallvec::SmallVec;
use std::fmt;
use std::str::FromStr;

/// Ordered header storage - inline up to 4 pairs
pub type Headers = SmallVec<[(String, String); 4]>;

/// Unique message identifier (ULID)
///
/// ULIDs are lexicographically sortable by creation time, which keeps
/// DLQ stores and transaction buffers naturally ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(ulid::Ulid);

impl MessageId {
    /// Generate a new unique id
    #[inline]
    pub fn new() -> Self {
        Self(ulid::Ulid::new())
    }

    /// The underlying ULID
    #[inline]
    pub fn as_ulid(&self) -> ulid::Ulid {
        self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for MessageId {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(ulid::Ulid::from_string(s)?))
    }
}

impl From<ulid::Ulid> for MessageId {
    fn from(ulid: ulid::Ulid) -> Self {
        Self(ulid)
    }
}

/// The universal event envelope - broker-agnostic, zero-copy payload
///
/// # Example
///
/// ```
/// use bytes::Bytes;
/// use varma_core::Message;
///
/// let msg = Message::new("orders", Bytes::from(r#"{"order_id": 1}"#))
///     .with_key("customer-42")
///     .with_correlation_id("req-abc")
///     .with_header("content-type", "application/json");
///
/// assert_eq!(msg.topic, "orders");
/// assert_eq!(msg.key.as_deref(), Some("customer-42"));
/// assert_eq!(msg.header("content-type"), Some("application/json"));
/// ```
#[derive(Debug, Clone)]
pub struct Message {
    /// Unique identifier (ULID)
    pub id: MessageId,

    /// Destination topic
    pub topic: String,

    /// Partitioning key - brokers hash this to pick a partition
    pub key: Option<String>,

    /// Opaque payload - zero-copy via Bytes
    ///
    /// The core never interprets payload bytes beyond optional schema
    /// validation. Adapters serialize it for their wire format.
    pub payload: Bytes,

    /// Ordered headers propagated to the broker
    pub headers: Headers,

    /// Identifier threading together all messages of one logical workflow
    pub correlation_id: Option<String>,

    /// Id of the message that caused this one to be produced
    pub causation_id: Option<String>,

    /// Explicit partition hint - overrides key-based partitioning
    pub partition: Option<i32>,

    /// Unix timestamp in nanoseconds
    pub timestamp: i64,
}

impl Message {
    /// Create a new Message with auto-generated id and current timestamp
    pub fn new(topic: impl Into<String>, payload: Bytes) -> Self {
        Self {
            id: MessageId::new(),
            topic: topic.into(),
            key: None,
            payload,
            headers: SmallVec::new(),
            correlation_id: None,
            causation_id: None,
            partition: None,
            timestamp: chrono::Utc::now().timestamp_nanos_opt().unwrap_or(0),
        }
    }

    /// Set the partitioning key
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Append a header (ordered; later values win on lookup)
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Set the correlation id
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Set the causation id
    pub fn with_causation_id(mut self, id: impl Into<String>) -> Self {
        self.causation_id = Some(id.into());
        self
    }

    /// Set an explicit partition hint
    pub fn with_partition(mut self, partition: i32) -> Self {
        self.partition = Some(partition);
        self
    }

    /// Look up a header value (last write for the name wins)
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .rev()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Payload as a string slice (if valid UTF-8)
    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }

    /// Payload length in bytes
    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }
}
