//! In-process backend adapter
//!
//! Full-fidelity broker simulation used by tests and single-process
//! deployments: partitioned per-topic logs, committed consumer offsets,
//! atomic transactional batches and scripted failure injection. All
//! state sits behind one `parking_lot::Mutex`, which is what makes
//! `commit_batch` atomic: the whole batch lands in the logs in one
//! critical section, so a concurrent consumer sees all of it or none.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::Duration;
use varma_core::{DeliveryError, Message, RawMessage, SendAck, TopicOffset};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone)]
struct StoredRecord {
    offset: i64,
    key: Option<String>,
    payload: bytes::Bytes,
    headers: varma_core::Headers,
    timestamp: i64,
}

#[derive(Default)]
struct BrokerState {
    /// topic -> partition -> log
    logs: HashMap<String, HashMap<i32, Vec<StoredRecord>>>,
    /// (topic, partition) -> next offset to consume
    committed: HashMap<(String, i32), i64>,
    /// Transactions begun but not yet committed or aborted
    open_transactions: HashSet<String>,
    /// Scripted send failures, consumed front to back
    injected_failures: VecDeque<DeliveryError>,
    aborted_count: u64,
    committed_count: u64,
}

/// Broker adapter backed by process memory
pub struct InMemoryAdapter {
    state: Mutex<BrokerState>,
    partitions: i32,
}

impl Default for InMemoryAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryAdapter {
    /// Create an adapter with 4 partitions per topic
    pub fn new() -> Self {
        Self::with_partitions(4)
    }

    /// Create an adapter with an explicit per-topic partition count
    pub fn with_partitions(partitions: i32) -> Self {
        Self {
            state: Mutex::new(BrokerState::default()),
            partitions: partitions.max(1),
        }
    }

    /// Queue errors returned by the next `send` calls, in order
    ///
    /// Test hook: each queued error fails exactly one send, after which
    /// delivery resumes normally.
    pub fn inject_failures(&self, errors: impl IntoIterator<Item = DeliveryError>) {
        self.state.lock().injected_failures.extend(errors);
    }

    /// Queue `count` copies of a transient failure
    pub fn inject_transient_failures(&self, count: usize, reason: &str) {
        self.inject_failures(
            std::iter::repeat_with(|| DeliveryError::Transient(reason.to_string())).take(count),
        );
    }

    /// Total records stored under `topic` across all partitions
    pub fn topic_len(&self, topic: &str) -> usize {
        self.state
            .lock()
            .logs
            .get(topic)
            .map(|parts| parts.values().map(Vec::len).sum())
            .unwrap_or(0)
    }

    /// Committed and aborted transaction counts, for assertions
    pub fn transaction_counts(&self) -> (u64, u64) {
        let state = self.state.lock();
        (state.committed_count, state.aborted_count)
    }

    fn partition_for(&self, message: &Message) -> i32 {
        if let Some(p) = message.partition {
            return p.rem_euclid(self.partitions);
        }
        match &message.key {
            Some(key) => {
                let mut hasher = DefaultHasher::new();
                key.hash(&mut hasher);
                (hasher.finish() % self.partitions as u64) as i32
            }
            None => 0,
        }
    }

    /// Append one message to its partition log. Caller holds the lock.
    fn append(state: &mut BrokerState, partition: i32, message: &Message) -> SendAck {
        let log = state
            .logs
            .entry(message.topic.clone())
            .or_default()
            .entry(partition)
            .or_default();
        let offset = log.len() as i64;
        log.push(StoredRecord {
            offset,
            key: message.key.clone(),
            payload: message.payload.clone(),
            headers: message.headers.clone(),
            timestamp: message.timestamp,
        });
        SendAck { partition, offset }
    }

    fn drain_available(&self, topics: &[String]) -> Vec<RawMessage> {
        let state = self.state.lock();
        let mut out = Vec::new();
        for topic in topics {
            let Some(partitions) = state.logs.get(topic) else {
                continue;
            };
            for (&partition, log) in partitions {
                let start = state
                    .committed
                    .get(&(topic.clone(), partition))
                    .copied()
                    .unwrap_or(0);
                for record in log.iter().skip(start as usize) {
                    out.push(RawMessage {
                        topic: topic.clone(),
                        partition,
                        offset: record.offset,
                        key: record.key.clone(),
                        payload: record.payload.clone(),
                        headers: record.headers.clone(),
                        timestamp: record.timestamp,
                    });
                }
            }
        }
        out.sort_by_key(|m| (m.partition, m.offset));
        out
    }
}

#[async_trait]
impl varma_core::BackendAdapter for InMemoryAdapter {
    fn name(&self) -> &'static str {
        "in-memory"
    }

    async fn connect(&self, _endpoints: &[String]) -> Result<(), DeliveryError> {
        Ok(())
    }

    async fn send(&self, message: &Message) -> Result<SendAck, DeliveryError> {
        let partition = self.partition_for(message);
        let mut state = self.state.lock();
        if let Some(error) = state.injected_failures.pop_front() {
            return Err(error);
        }
        Ok(Self::append(&mut state, partition, message))
    }

    async fn send_batch(&self, messages: &[Message]) -> Result<Vec<SendAck>, DeliveryError> {
        let partitions: Vec<i32> = messages.iter().map(|m| self.partition_for(m)).collect();
        let mut state = self.state.lock();
        if let Some(error) = state.injected_failures.pop_front() {
            return Err(error);
        }
        Ok(messages
            .iter()
            .zip(partitions)
            .map(|(message, partition)| Self::append(&mut state, partition, message))
            .collect())
    }

    async fn consume(
        &self,
        topics: &[String],
        timeout: Duration,
    ) -> Result<Vec<RawMessage>, DeliveryError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let available = self.drain_available(topics);
            if !available.is_empty() {
                return Ok(available);
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(vec![]);
            }
            tokio::time::sleep(POLL_INTERVAL.min(timeout)).await;
        }
    }

    async fn commit_offsets(&self, offsets: &[TopicOffset]) -> Result<(), DeliveryError> {
        let mut state = self.state.lock();
        for o in offsets {
            state
                .committed
                .insert((o.topic.clone(), o.partition), o.offset);
        }
        Ok(())
    }

    async fn begin_transaction(&self, transaction_id: &str) -> Result<(), DeliveryError> {
        let mut state = self.state.lock();
        if !state.open_transactions.insert(transaction_id.to_string()) {
            return Err(DeliveryError::State(format!(
                "transaction '{transaction_id}' is already open"
            )));
        }
        Ok(())
    }

    async fn commit_batch(
        &self,
        transaction_id: &str,
        messages: &[Message],
    ) -> Result<Vec<SendAck>, DeliveryError> {
        let partitions: Vec<i32> = messages.iter().map(|m| self.partition_for(m)).collect();
        let mut state = self.state.lock();
        if !state.open_transactions.remove(transaction_id) {
            return Err(DeliveryError::State(format!(
                "transaction '{transaction_id}' is not open"
            )));
        }
        if let Some(error) = state.injected_failures.pop_front() {
            // A failed commit leaves nothing in the logs
            state.aborted_count += 1;
            return Err(error);
        }
        // Single critical section: the whole batch becomes visible at once
        let acks = messages
            .iter()
            .zip(partitions)
            .map(|(message, partition)| Self::append(&mut state, partition, message))
            .collect();
        state.committed_count += 1;
        Ok(acks)
    }

    async fn abort_transaction(&self, transaction_id: &str) -> Result<(), DeliveryError> {
        let mut state = self.state.lock();
        if !state.open_transactions.remove(transaction_id) {
            return Err(DeliveryError::State(format!(
                "transaction '{transaction_id}' is not open"
            )));
        }
        state.aborted_count += 1;
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), DeliveryError> {
        let open = self.state.lock().open_transactions.len();
        if open > 0 {
            tracing::warn!(open_transactions = open, "shutting down with open transactions");
        }
        Ok(())
    }
}
