//! Bounded retry with exponential backoff
//!
//! Wraps an async operation with retry under a [`RetryPolicy`]. Only
//! errors classified retryable consume attempts; terminal and caller
//! errors propagate immediately. Backoff sleeps suspend the task via
//! `tokio::time::sleep` and never block unrelated operations.

use crate::error::{DeliveryError, Result};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Lock-free xorshift64 PRNG for jitter randomness
///
/// Atomic compare-exchange keeps it thread-safe without locks; better
/// distribution than naive system-time approaches and no `rand` dependency.
struct Xorshift64 {
    state: AtomicU64,
}

impl Xorshift64 {
    fn new() -> Self {
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0x853c49e6748fea9b);
        let seed = if seed == 0 { 0x853c49e6748fea9b } else { seed };
        Self {
            state: AtomicU64::new(seed),
        }
    }

    fn next(&self) -> u64 {
        loop {
            let old = self.state.load(Ordering::Acquire);
            let mut x = old;
            x ^= x << 13;
            x ^= x >> 7;
            x ^= x << 17;
            if self
                .state
                .compare_exchange_weak(old, x, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return x;
            }
        }
    }

    /// Random f64 in [0.0, 1.0)
    fn next_f64(&self) -> f64 {
        (self.next() as f64) / (u64::MAX as f64)
    }
}

static JITTER_RNG: std::sync::LazyLock<Xorshift64> = std::sync::LazyLock::new(Xorshift64::new);

fn rand_jitter() -> f64 {
    JITTER_RNG.next_f64()
}

/// Bounded exponential backoff policy
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum retry attempts after the initial try (0 = no retries)
    pub max_retries: u32,
    /// Base delay for the first retry
    pub base_backoff: Duration,
    /// Cap applied to the computed delay
    pub max_backoff: Duration,
    /// Additive jitter as a fraction of the exponential delay (0.0-1.0)
    pub jitter_fraction: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(30),
            jitter_fraction: 0.25,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry `k` (0-indexed): `min(base * 2^k + jitter, max)`
    ///
    /// Jitter is additive in `[0, base * 2^k * jitter_fraction)`, so delays
    /// are non-decreasing in expectation until the cap.
    pub fn delay_for_retry(&self, k: u32) -> Duration {
        self.delay_with_jitter(k, rand_jitter())
    }

    /// Delay with an explicit jitter value in [0.0, 1.0) (for testing)
    pub fn delay_with_jitter(&self, k: u32, jitter: f64) -> Duration {
        // Microseconds for precision with small bases
        let base_us = self.base_backoff.as_micros() as f64 * 2f64.powi(k as i32);
        let jitter_us = base_us * self.jitter_fraction * jitter;
        let capped_us = (base_us + jitter_us).min(self.max_backoff.as_micros() as f64);
        Duration::from_micros(capped_us as u64)
    }
}

/// Executes operations under a retry policy
///
/// Shared by all publish calls; only telemetry counters are mutable.
pub struct RetryExecutor {
    /// Metrics: total retry attempts across all runs
    retry_total: AtomicU64,
    /// Metrics: runs that recovered after at least one retry
    recovered_total: AtomicU64,
}

impl RetryExecutor {
    /// Create a new executor
    pub fn new() -> Self {
        Self {
            retry_total: AtomicU64::new(0),
            recovered_total: AtomicU64::new(0),
        }
    }

    /// Total retry attempts consumed
    pub fn retry_total(&self) -> u64 {
        self.retry_total.load(Ordering::Relaxed)
    }

    /// Runs that recovered after at least one retry
    pub fn recovered_total(&self) -> u64 {
        self.recovered_total.load(Ordering::Relaxed)
    }

    /// Run `op`, retrying retryable errors up to `policy.max_retries`
    pub async fn run<T, F, Fut>(&self, policy: &RetryPolicy, op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.run_counted(policy, op).await.0
    }

    /// Like [`run`](Self::run) but also reports how many attempts were made
    ///
    /// The attempt count includes the initial try, so a first-time success
    /// reports 1 and full exhaustion reports `max_retries + 1`.
    pub async fn run_counted<T, F, Fut>(&self, policy: &RetryPolicy, mut op: F) -> (Result<T>, u32)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempts = 0u32;
        let mut last_error: Option<DeliveryError> = None;

        for retry in 0..=policy.max_retries {
            if retry > 0 {
                let delay = policy.delay_for_retry(retry - 1);
                self.retry_total.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    retry = retry,
                    max_retries = policy.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    "retrying operation"
                );
                tokio::time::sleep(delay).await;
            }

            attempts += 1;
            match op().await {
                Ok(value) => {
                    if retry > 0 {
                        self.recovered_total.fetch_add(1, Ordering::Relaxed);
                        tracing::info!(retry = retry, "operation recovered after retry");
                    }
                    return (Ok(value), attempts);
                }
                Err(e) if e.is_retryable() => {
                    tracing::warn!(
                        attempt = attempts,
                        error = %e,
                        "retryable failure"
                    );
                    last_error = Some(e);
                }
                Err(e) => {
                    // Terminal and caller errors propagate without
                    // consuming further retries
                    return (Err(e), attempts);
                }
            }
        }

        let err =
            last_error.unwrap_or_else(|| DeliveryError::Transient("all retries exhausted".into()));
        (Err(err), attempts)
    }
}

impl Default for RetryExecutor {
    fn default() -> Self {
        Self::new()
    }
}
