//! Transactional publish coordination
//!
//! [`TransactionCoordinator`] buffers messages client-side and hands the
//! whole batch to [`BackendAdapter::commit_batch`] in one call, so
//! atomicity is the broker's job and the coordinator's job is the state
//! machine: `init -> begin -> send* -> commit | abort`. Every out-of-order
//! call fails with [`DeliveryError::State`] instead of silently corrupting
//! the buffer.

use crate::error::{DeliveryError, Result};
use crate::metrics::Metrics;
use parking_lot::Mutex;
use std::sync::Arc;
use varma_core::{BackendAdapter, Message, SendAck};

/// Coordinator lifecycle state
///
/// `Committed` and `Aborted` report the previous transaction's outcome;
/// both accept a new `begin_transaction` like `Idle` does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    /// `init_transactions` has not run
    Uninitialized,
    /// Ready for `begin_transaction`
    Idle,
    /// A transaction is open and buffering sends
    Active,
    /// `commit_transaction` is in flight
    Committing,
    /// `abort_transaction` is in flight
    Aborting,
    /// The last transaction committed
    Committed,
    /// The last transaction aborted (explicitly or via commit failure)
    Aborted,
}

impl TxnState {
    fn accepts_begin(self) -> bool {
        matches!(self, TxnState::Idle | TxnState::Committed | TxnState::Aborted)
    }
}

struct TxnInner {
    state: TxnState,
    transaction_id: Option<String>,
    buffer: Vec<Message>,
}

/// Client-side transaction state machine over a [`BackendAdapter`]
pub struct TransactionCoordinator {
    adapter: Arc<dyn BackendAdapter>,
    inner: Mutex<TxnInner>,
}

impl TransactionCoordinator {
    /// Create a coordinator in the uninitialized state
    pub fn new(adapter: Arc<dyn BackendAdapter>) -> Self {
        Self {
            adapter,
            inner: Mutex::new(TxnInner {
                state: TxnState::Uninitialized,
                transaction_id: None,
                buffer: Vec::new(),
            }),
        }
    }

    /// Prepare the coordinator for transactional publishing
    ///
    /// Idempotent while no transaction is open.
    pub fn init_transactions(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        match inner.state {
            TxnState::Active | TxnState::Committing | TxnState::Aborting => {
                Err(DeliveryError::State(format!(
                    "cannot init transactions while {:?}",
                    inner.state
                )))
            }
            _ => {
                inner.state = TxnState::Idle;
                Ok(())
            }
        }
    }

    /// Open a new transaction, returning its id
    pub async fn begin_transaction(&self) -> Result<String> {
        let transaction_id = format!("txn-{}", ulid::Ulid::new());
        {
            let mut inner = self.inner.lock();
            match inner.state {
                state if state.accepts_begin() => {
                    inner.state = TxnState::Active;
                    inner.transaction_id = Some(transaction_id.clone());
                    inner.buffer.clear();
                }
                TxnState::Uninitialized => {
                    return Err(DeliveryError::State(
                        "begin_transaction before init_transactions".into(),
                    ));
                }
                state => {
                    return Err(DeliveryError::State(format!(
                        "begin_transaction while {state:?}"
                    )));
                }
            }
        }

        if let Err(e) = self.adapter.begin_transaction(&transaction_id).await {
            let mut inner = self.inner.lock();
            inner.state = TxnState::Idle;
            inner.transaction_id = None;
            return Err(e);
        }

        tracing::debug!(transaction_id = %transaction_id, "transaction opened");
        Ok(transaction_id)
    }

    /// Buffer a message into the open transaction
    ///
    /// Nothing reaches the broker until `commit_transaction`.
    pub fn send_transactional(&self, message: Message) -> Result<()> {
        let mut inner = self.inner.lock();
        match inner.state {
            TxnState::Active => {
                inner.buffer.push(message);
                Ok(())
            }
            state => Err(DeliveryError::State(format!(
                "send_transactional while {state:?}"
            ))),
        }
    }

    /// Atomically publish the buffered batch
    ///
    /// On success every message is visible to consumers at once. On
    /// failure nothing is published and the outcome is recorded as
    /// aborted; the adapter is expected to leave the broker-side
    /// transaction closed. A new `begin_transaction` is accepted either
    /// way.
    pub async fn commit_transaction(&self) -> Result<Vec<SendAck>> {
        let (transaction_id, buffer) = {
            let mut inner = self.inner.lock();
            match inner.state {
                TxnState::Active => {
                    inner.state = TxnState::Committing;
                    let id = inner.transaction_id.take().ok_or_else(|| {
                        DeliveryError::State("active transaction without an id".into())
                    })?;
                    (id, std::mem::take(&mut inner.buffer))
                }
                state => {
                    return Err(DeliveryError::State(format!(
                        "commit_transaction while {state:?}"
                    )));
                }
            }
        };

        let outcome = self.adapter.commit_batch(&transaction_id, &buffer).await;
        self.inner.lock().state = if outcome.is_ok() {
            TxnState::Committed
        } else {
            TxnState::Aborted
        };

        match outcome {
            Ok(acks) => {
                tracing::info!(
                    transaction_id = %transaction_id,
                    messages = buffer.len(),
                    "transaction committed"
                );
                if let Some(m) = Metrics::get() {
                    m.record_transaction("committed");
                }
                Ok(acks)
            }
            Err(e) => {
                tracing::warn!(
                    transaction_id = %transaction_id,
                    messages = buffer.len(),
                    error = %e,
                    "transaction commit failed, nothing published"
                );
                if let Some(m) = Metrics::get() {
                    m.record_transaction("aborted");
                }
                Err(e)
            }
        }
    }

    /// Discard the open transaction without publishing
    pub async fn abort_transaction(&self) -> Result<()> {
        let (transaction_id, discarded) = {
            let mut inner = self.inner.lock();
            match inner.state {
                TxnState::Active => {
                    inner.state = TxnState::Aborting;
                    let id = inner.transaction_id.take().ok_or_else(|| {
                        DeliveryError::State("active transaction without an id".into())
                    })?;
                    let discarded = inner.buffer.len();
                    inner.buffer.clear();
                    (id, discarded)
                }
                state => {
                    return Err(DeliveryError::State(format!(
                        "abort_transaction while {state:?}"
                    )));
                }
            }
        };

        let outcome = self.adapter.abort_transaction(&transaction_id).await;
        self.inner.lock().state = TxnState::Aborted;

        tracing::info!(
            transaction_id = %transaction_id,
            discarded = discarded,
            "transaction aborted"
        );
        if let Some(m) = Metrics::get() {
            m.record_transaction("aborted");
        }
        outcome
    }

    /// Current lifecycle state
    pub fn state(&self) -> TxnState {
        self.inner.lock().state
    }

    /// Messages buffered in the open transaction
    pub fn buffered(&self) -> usize {
        self.inner.lock().buffer.len()
    }
}
