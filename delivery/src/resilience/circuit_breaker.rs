//! Named circuit breakers
//!
//! Implements the circuit breaker pattern to fail fast when a backend is
//! unhealthy. Breakers are named and live in an explicitly constructed
//! [`CircuitBreakerRegistry`]; the publish path guards every adapter call
//! through [`CircuitBreakerRegistry::execute`].

use crate::error::{DeliveryError, ErrorClass, Result};
use crate::metrics::Metrics;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Circuit breaker state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Circuit is closed - requests flow through
    Closed,
    /// Circuit is open - requests fail fast
    Open,
    /// Testing if backend recovered - allowing limited probes
    HalfOpen,
}

impl CircuitState {
    /// Convert to Prometheus metric value (0=Closed, 1=Open, 2=HalfOpen)
    pub fn as_metric_value(self) -> f64 {
        match self {
            CircuitState::Closed => 0.0,
            CircuitState::Open => 1.0,
            CircuitState::HalfOpen => 2.0,
        }
    }
}

/// Configuration for circuit breaker behavior
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures to open the circuit
    pub failure_threshold: u32,
    /// Consecutive successes in half-open to close the circuit
    pub success_threshold: u32,
    /// Time to wait before transitioning from Open to HalfOpen
    pub reset_timeout: Duration,
    /// Maximum concurrent probes admitted in HalfOpen state
    pub half_open_max_probes: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            reset_timeout: Duration::from_secs(30),
            half_open_max_probes: 1,
        }
    }
}

/// Observable snapshot of one breaker for telemetry
#[derive(Debug, Clone)]
pub struct CircuitSnapshot {
    /// Breaker name
    pub name: String,
    /// Current state
    pub state: CircuitState,
    /// Consecutive failures observed
    pub failure_count: u32,
    /// Consecutive half-open successes observed
    pub success_count: u32,
    /// When the breaker last changed state
    pub last_transition: Instant,
    /// Active configuration
    pub config: CircuitBreakerConfig,
    /// Times this circuit opened
    pub opened_total: u64,
    /// Calls rejected while open
    pub rejected_total: u64,
}

/// Internal state tracking
struct BreakerInner {
    state: CircuitState,
    config: CircuitBreakerConfig,
    failure_count: u32,
    success_count: u32,
    last_transition: Instant,
    half_open_probes: u32,
}

impl BreakerInner {
    fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            state: CircuitState::Closed,
            config,
            failure_count: 0,
            success_count: 0,
            last_transition: Instant::now(),
            half_open_probes: 0,
        }
    }

    fn transition(&mut self, next: CircuitState) {
        self.state = next;
        self.last_transition = Instant::now();
        self.half_open_probes = 0;
    }
}

/// One named circuit breaker
pub struct CircuitBreaker {
    name: String,
    inner: RwLock<BreakerInner>,
    /// Metrics: times circuit opened
    opened_total: AtomicU64,
    /// Metrics: calls rejected by open circuit
    rejected_total: AtomicU64,
}

impl CircuitBreaker {
    fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            inner: RwLock::new(BreakerInner::new(config)),
            opened_total: AtomicU64::new(0),
            rejected_total: AtomicU64::new(0),
        }
    }

    /// Breaker name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state (resolves a pending Open → HalfOpen transition first,
    /// so observers never see a stale Open past the reset timeout)
    pub fn state(&self) -> CircuitState {
        let inner = self.inner.read();
        if inner.state == CircuitState::Open
            && inner.last_transition.elapsed() >= inner.config.reset_timeout
        {
            return CircuitState::HalfOpen;
        }
        inner.state
    }

    /// Snapshot for telemetry
    pub fn snapshot(&self) -> CircuitSnapshot {
        let inner = self.inner.read();
        CircuitSnapshot {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            last_transition: inner.last_transition,
            config: inner.config.clone(),
            opened_total: self.opened_total.load(Ordering::Relaxed),
            rejected_total: self.rejected_total.load(Ordering::Relaxed),
        }
    }

    /// Check whether a call may proceed, applying time-based transitions
    ///
    /// Returns `Err(CircuitOpen)` without invoking anything when the
    /// circuit is open and the reset timeout has not elapsed.
    fn try_acquire(&self) -> Result<()> {
        let mut inner = self.inner.write();

        match inner.state {
            CircuitState::Closed => Ok(()),

            CircuitState::Open => {
                if inner.last_transition.elapsed() >= inner.config.reset_timeout {
                    inner.transition(CircuitState::HalfOpen);
                    inner.success_count = 0;
                    inner.half_open_probes = 1; // Admit this call as the probe
                    tracing::info!(circuit = %self.name, "circuit transitioning to half-open");
                    self.publish_state(CircuitState::HalfOpen);
                    return Ok(());
                }
                self.rejected_total.fetch_add(1, Ordering::Relaxed);
                if let Some(metrics) = Metrics::get() {
                    metrics.record_circuit_rejected(&self.name);
                }
                Err(DeliveryError::CircuitOpen(self.name.clone()))
            }

            CircuitState::HalfOpen => {
                if inner.half_open_probes < inner.config.half_open_max_probes {
                    inner.half_open_probes += 1;
                    Ok(())
                } else {
                    self.rejected_total.fetch_add(1, Ordering::Relaxed);
                    if let Some(metrics) = Metrics::get() {
                        metrics.record_circuit_rejected(&self.name);
                    }
                    Err(DeliveryError::CircuitOpen(self.name.clone()))
                }
            }
        }
    }

    /// Record a successful call
    fn on_success(&self) {
        let mut inner = self.inner.write();
        inner.failure_count = 0;

        if inner.state == CircuitState::HalfOpen {
            // Release the probe slot so the next probe is admitted
            inner.half_open_probes = inner.half_open_probes.saturating_sub(1);
            inner.success_count += 1;
            if inner.success_count >= inner.config.success_threshold {
                inner.transition(CircuitState::Closed);
                inner.success_count = 0;
                tracing::info!(circuit = %self.name, "circuit closed - backend recovered");
                self.publish_state(CircuitState::Closed);
            }
        }
    }

    /// Record a failed call
    fn on_failure(&self) {
        let mut inner = self.inner.write();
        inner.success_count = 0;
        inner.failure_count += 1;

        match inner.state {
            CircuitState::Closed => {
                if inner.failure_count >= inner.config.failure_threshold {
                    inner.transition(CircuitState::Open);
                    self.opened_total.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        circuit = %self.name,
                        failures = inner.failure_count,
                        "circuit opened - too many failures"
                    );
                    self.record_opened();
                }
            }
            CircuitState::HalfOpen => {
                // Any probe failure immediately re-opens and restarts the timer
                inner.transition(CircuitState::Open);
                inner.failure_count = 0;
                self.opened_total.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(circuit = %self.name, "circuit re-opened - probe failed");
                self.record_opened();
            }
            CircuitState::Open => {
                // In-flight call that started before the transition; timer unchanged
            }
        }
    }

    /// Operational override: trip the circuit open
    pub fn force_open(&self) {
        let mut inner = self.inner.write();
        if inner.state != CircuitState::Open {
            inner.transition(CircuitState::Open);
            self.opened_total.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(circuit = %self.name, "circuit forced open");
            self.record_opened();
        }
    }

    /// Operational override: reset the circuit to closed with counters cleared
    pub fn force_closed(&self) {
        let mut inner = self.inner.write();
        inner.transition(CircuitState::Closed);
        inner.failure_count = 0;
        inner.success_count = 0;
        tracing::info!(circuit = %self.name, "circuit forced closed");
        self.publish_state(CircuitState::Closed);
    }

    fn configure(&self, config: CircuitBreakerConfig) {
        self.inner.write().config = config;
    }

    fn record_opened(&self) {
        if let Some(metrics) = Metrics::get() {
            metrics.record_circuit_opened(&self.name);
            metrics.set_circuit_state(&self.name, CircuitState::Open.as_metric_value());
        }
    }

    fn publish_state(&self, state: CircuitState) {
        if let Some(metrics) = Metrics::get() {
            metrics.set_circuit_state(&self.name, state.as_metric_value());
        }
    }
}

/// Registry of named circuit breakers
///
/// Explicitly constructed and owned by the `Publisher` - never a
/// module-level singleton. Breakers are created lazily on first use with
/// the registry's default configuration.
pub struct CircuitBreakerRegistry {
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    default_config: CircuitBreakerConfig,
}

impl CircuitBreakerRegistry {
    /// Create a registry with the given default breaker configuration
    pub fn new(default_config: CircuitBreakerConfig) -> Self {
        Self {
            breakers: RwLock::new(HashMap::new()),
            default_config,
        }
    }

    /// Create a registry with default configuration
    pub fn with_defaults() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }

    /// Execute `op` guarded by the named circuit
    ///
    /// Creates the breaker on first use. Failures with caller
    /// classification (validation, state misuse) do not count against the
    /// circuit - they say nothing about backend health.
    pub async fn execute<T, F, Fut>(&self, name: &str, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let breaker = self.get_or_create(name);
        breaker.try_acquire()?;

        match op().await {
            Ok(value) => {
                breaker.on_success();
                Ok(value)
            }
            Err(e) => {
                if e.class() != ErrorClass::Caller {
                    breaker.on_failure();
                }
                Err(e)
            }
        }
    }

    /// Set (or replace) the configuration of a named breaker
    ///
    /// Creates the breaker if absent. Existing counters and state are kept;
    /// new thresholds apply from the next call.
    pub fn configure(&self, name: &str, config: CircuitBreakerConfig) {
        self.get_or_create(name).configure(config);
    }

    /// Operational override: trip the named circuit open
    pub fn force_open(&self, name: &str) {
        self.get_or_create(name).force_open();
    }

    /// Operational override: reset the named circuit to closed
    pub fn force_closed(&self, name: &str) {
        self.get_or_create(name).force_closed();
    }

    /// Current state of a named circuit, if it exists
    pub fn state(&self, name: &str) -> Option<CircuitState> {
        self.breakers.read().get(name).map(|b| b.state())
    }

    /// Telemetry snapshot of a named circuit, if it exists
    pub fn snapshot(&self, name: &str) -> Option<CircuitSnapshot> {
        self.breakers.read().get(name).map(|b| b.snapshot())
    }

    /// Telemetry snapshots of all circuits
    pub fn snapshots(&self) -> Vec<CircuitSnapshot> {
        self.breakers.read().values().map(|b| b.snapshot()).collect()
    }

    fn get_or_create(&self, name: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.read().get(name) {
            return Arc::clone(breaker);
        }
        let mut breakers = self.breakers.write();
        Arc::clone(
            breakers
                .entry(name.to_string())
                .or_insert_with(|| {
                    Arc::new(CircuitBreaker::new(name, self.default_config.clone()))
                }),
        )
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    /// Operation that fails N times then succeeds, counting invocations
    struct Flaky {
        calls: AtomicU32,
        failures: u32,
    }

    impl Flaky {
        fn new(failures: u32) -> Self {
            Self {
                calls: AtomicU32::new(0),
                failures,
            }
        }

        async fn run(&self) -> Result<u32> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                Err(DeliveryError::Transient("simulated".into()))
            } else {
                Ok(n)
            }
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    fn registry(failure_threshold: u32, reset_timeout: Duration) -> CircuitBreakerRegistry {
        CircuitBreakerRegistry::new(CircuitBreakerConfig {
            failure_threshold,
            success_threshold: 1,
            reset_timeout,
            half_open_max_probes: 1,
        })
    }

    #[tokio::test]
    async fn circuit_starts_closed() {
        let reg = CircuitBreakerRegistry::with_defaults();
        let op = Flaky::new(0);
        reg.execute("c", || op.run()).await.unwrap();
        assert_eq!(reg.state("c"), Some(CircuitState::Closed));
    }

    #[tokio::test]
    async fn circuit_opens_after_threshold() {
        let reg = registry(3, Duration::from_secs(60));
        let op = Flaky::new(100);

        for _ in 0..3 {
            let _ = reg.execute("c", || op.run()).await;
        }

        assert_eq!(reg.state("c"), Some(CircuitState::Open));
        assert_eq!(reg.snapshot("c").unwrap().opened_total, 1);
    }

    #[tokio::test]
    async fn open_circuit_rejects_without_invoking() {
        let reg = registry(5, Duration::from_secs(60));
        let op = Flaky::new(100);

        for _ in 0..5 {
            let _ = reg.execute("c", || op.run()).await;
        }
        assert_eq!(op.calls(), 5);

        // 6th call short-circuits: operation not invoked
        let err = reg.execute("c", || op.run()).await.unwrap_err();
        assert!(matches!(err, DeliveryError::CircuitOpen(_)));
        assert_eq!(op.calls(), 5);
        assert_eq!(reg.snapshot("c").unwrap().rejected_total, 1);
    }

    #[tokio::test]
    async fn half_open_probe_failure_reopens() {
        let reg = registry(1, Duration::from_millis(10));
        let op = Flaky::new(100);

        let _ = reg.execute("c", || op.run()).await;
        assert_eq!(reg.state("c"), Some(CircuitState::Open));

        tokio::time::sleep(Duration::from_millis(15)).await;

        // Probe admitted, fails, back to open with timer restarted
        let _ = reg.execute("c", || op.run()).await;
        assert_eq!(op.calls(), 2);
        let snap = reg.snapshot("c").unwrap();
        assert_eq!(snap.state, CircuitState::Open);
        assert_eq!(snap.opened_total, 2);
    }

    #[tokio::test]
    async fn half_open_success_closes() {
        let reg = registry(1, Duration::from_millis(5));
        let op = Flaky::new(1); // Fails once, then succeeds

        let _ = reg.execute("c", || op.run()).await;
        assert_eq!(reg.state("c"), Some(CircuitState::Open));

        tokio::time::sleep(Duration::from_millis(10)).await;

        reg.execute("c", || op.run()).await.unwrap();
        assert_eq!(reg.state("c"), Some(CircuitState::Closed));
    }

    #[tokio::test]
    async fn success_threshold_requires_consecutive_probes() {
        let reg = CircuitBreakerRegistry::new(CircuitBreakerConfig {
            failure_threshold: 1,
            success_threshold: 2,
            reset_timeout: Duration::from_millis(5),
            half_open_max_probes: 1,
        });
        let op = Flaky::new(1);

        let _ = reg.execute("c", || op.run()).await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        // First probe succeeds but threshold is 2: still half-open
        reg.execute("c", || op.run()).await.unwrap();
        assert_eq!(reg.state("c"), Some(CircuitState::HalfOpen));

        // Second consecutive success closes
        reg.execute("c", || op.run()).await.unwrap();
        assert_eq!(reg.state("c"), Some(CircuitState::Closed));
    }

    #[tokio::test]
    async fn success_resets_failure_count() {
        let reg = registry(5, Duration::from_secs(60));
        let op = Flaky::new(2);

        let _ = reg.execute("c", || op.run()).await;
        let _ = reg.execute("c", || op.run()).await;
        reg.execute("c", || op.run()).await.unwrap();

        assert_eq!(reg.state("c"), Some(CircuitState::Closed));
        assert_eq!(reg.snapshot("c").unwrap().failure_count, 0);
    }

    #[tokio::test]
    async fn caller_errors_do_not_trip_circuit() {
        let reg = registry(1, Duration::from_secs(60));

        for _ in 0..5 {
            let _ = reg
                .execute("c", || async {
                    Err::<(), _>(DeliveryError::Validation("bad payload".into()))
                })
                .await;
        }

        assert_eq!(reg.state("c"), Some(CircuitState::Closed));
    }

    #[tokio::test]
    async fn force_open_and_force_closed() {
        let reg = CircuitBreakerRegistry::with_defaults();
        let op = Flaky::new(0);

        reg.force_open("c");
        let err = reg.execute("c", || op.run()).await.unwrap_err();
        assert!(matches!(err, DeliveryError::CircuitOpen(_)));
        assert_eq!(op.calls(), 0);

        reg.force_closed("c");
        reg.execute("c", || op.run()).await.unwrap();
        assert_eq!(op.calls(), 1);
    }

    #[tokio::test]
    async fn configure_updates_thresholds_in_place() {
        let reg = registry(10, Duration::from_secs(60));
        let op = Flaky::new(100);

        reg.configure(
            "c",
            CircuitBreakerConfig {
                failure_threshold: 2,
                ..CircuitBreakerConfig::default()
            },
        );

        let _ = reg.execute("c", || op.run()).await;
        let _ = reg.execute("c", || op.run()).await;
        assert_eq!(reg.state("c"), Some(CircuitState::Open));
    }
}
