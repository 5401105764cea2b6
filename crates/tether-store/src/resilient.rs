//! Resilience wrapper for any [`SessionStore`].
//!
//! Each call passes, in order, through:
//! 1. a circuit breaker (fails fast with [`StoreError::CircuitOpen`] while open)
//! 2. a semaphore bulkhead bounding in-flight store I/O
//! 3. a per-attempt timeout
//! 4. bounded retry with exponential backoff and jitter for transient errors
//!
//! Exhausted retries surface as [`StoreError::Unavailable`]. `NotFound`,
//! `Fenced`, and other non-transient outcomes return immediately and count
//! as healthy responses for the breaker.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tether_core::retry::RetryConfig;
use tether_core::{InstanceId, SessionId};
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::errors::{Result, StoreError};
use crate::session::{ClaimOutcome, Session};
use crate::store::SessionStore;

/// Tuning for [`ResilientStore`].
#[derive(Clone, Debug)]
pub struct ResilienceConfig {
    /// Bound on one attempt.
    pub op_timeout: Duration,
    /// Retry policy for transient failures.
    pub retry: RetryConfig,
    /// Concurrent calls admitted to the inner store.
    pub max_in_flight: usize,
    /// Consecutive transient failures that open the breaker.
    pub breaker_failure_threshold: u32,
    /// How long the breaker stays open before a trial call.
    pub breaker_cooldown: Duration,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            op_timeout: Duration::from_secs(2),
            retry: RetryConfig::default(),
            max_in_flight: 32,
            breaker_failure_threshold: 5,
            breaker_cooldown: Duration::from_secs(10),
        }
    }
}

/// Observable breaker state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CircuitState {
    /// Calls flow normally.
    Closed,
    /// Calls fail fast.
    Open,
    /// Cooldown elapsed; the next call is a trial.
    HalfOpen,
}

#[derive(Debug, Default)]
struct Breaker {
    consecutive_failures: u32,
    open_until: Option<Instant>,
    half_open: bool,
}

/// A [`SessionStore`] that adds timeout, retry, bulkhead, and breaker
/// behavior around `S`.
#[derive(Debug)]
pub struct ResilientStore<S> {
    inner: S,
    config: ResilienceConfig,
    permits: Semaphore,
    breaker: Mutex<Breaker>,
}

impl<S: SessionStore> ResilientStore<S> {
    /// Wrap `inner`.
    pub fn new(inner: S, config: ResilienceConfig) -> Self {
        let permits = Semaphore::new(config.max_in_flight.max(1));
        Self {
            inner,
            config,
            permits,
            breaker: Mutex::new(Breaker::default()),
        }
    }

    /// The wrapped store.
    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Current breaker state.
    pub fn circuit_state(&self) -> CircuitState {
        let b = self.breaker.lock();
        match b.open_until {
            Some(until) if Instant::now() < until => CircuitState::Open,
            Some(_) => CircuitState::HalfOpen,
            None if b.half_open => CircuitState::HalfOpen,
            None => CircuitState::Closed,
        }
    }

    fn admit(&self) -> Result<()> {
        let mut b = self.breaker.lock();
        if let Some(until) = b.open_until {
            if Instant::now() < until {
                return Err(StoreError::CircuitOpen);
            }
            b.open_until = None;
            b.half_open = true;
        }
        Ok(())
    }

    fn record_success(&self) {
        let mut b = self.breaker.lock();
        if b.half_open {
            debug!("session store circuit closed");
        }
        b.consecutive_failures = 0;
        b.half_open = false;
    }

    fn record_failure(&self) {
        let mut b = self.breaker.lock();
        b.consecutive_failures = b.consecutive_failures.saturating_add(1);
        if b.half_open || b.consecutive_failures >= self.config.breaker_failure_threshold {
            b.open_until = Some(Instant::now() + self.config.breaker_cooldown);
            b.half_open = false;
            warn!(
                failures = b.consecutive_failures,
                cooldown_ms = self.config.breaker_cooldown.as_millis(),
                "session store circuit opened"
            );
            metrics::counter!("session_store_circuit_open_total").increment(1);
        }
    }

    async fn call<T, F, Fut>(&self, op: &'static str, f: F) -> Result<T>
    where
        F: Fn() -> Fut + Send + Sync,
        Fut: Future<Output = Result<T>> + Send,
        T: Send,
    {
        let mut attempt = 0u32;
        loop {
            self.admit()?;

            let result = {
                let _permit = self
                    .permits
                    .acquire()
                    .await
                    .map_err(|_| StoreError::Unavailable("bulkhead closed".into()))?;
                match tokio::time::timeout(self.config.op_timeout, f()).await {
                    Ok(r) => r,
                    Err(_) => Err(StoreError::Timeout(self.config.op_timeout)),
                }
            };

            match result {
                Err(e) if e.is_transient() => {
                    self.record_failure();
                    if attempt >= self.config.retry.max_retries {
                        warn!(op, attempts = attempt + 1, error = %e, "session store retries exhausted");
                        return Err(StoreError::Unavailable(format!("{op}: {e}")));
                    }
                    let delay = self.config.retry.delay(attempt, rand::random::<f64>());
                    metrics::counter!("session_store_retries_total", "op" => op).increment(1);
                    debug!(op, attempt, delay_ms = delay.as_millis(), error = %e, "retrying session store call");
                    attempt += 1;
                    tokio::time::sleep(delay).await;
                }
                other => {
                    self.record_success();
                    return other;
                }
            }
        }
    }
}

#[async_trait]
impl<S: SessionStore> SessionStore for ResilientStore<S> {
    async fn save(&self, session: &Session) -> Result<()> {
        self.call("save", || self.inner.save(session)).await
    }

    async fn load(&self, session_id: &SessionId) -> Result<Session> {
        self.call("load", || self.inner.load(session_id)).await
    }

    async fn claim(
        &self,
        session_id: &SessionId,
        instance_id: &InstanceId,
        requested_epoch: u64,
    ) -> Result<ClaimOutcome> {
        self.call("claim", || {
            self.inner.claim(session_id, instance_id, requested_epoch)
        })
        .await
    }

    async fn touch(&self, session_id: &SessionId) -> Result<()> {
        self.call("touch", || self.inner.touch(session_id)).await
    }

    async fn expire_sweep(&self) -> Result<Vec<SessionId>> {
        self.call("expire_sweep", || self.inner.expire_sweep()).await
    }

    async fn remove(&self, session_id: &SessionId) -> Result<bool> {
        self.call("remove", || self.inner.remove(session_id)).await
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemorySessionStore;
    use assert_matches::assert_matches;
    use chrono::Utc;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

    /// Fails the first `fail_first` calls with a transient error, then
    /// delegates to a memory store.
    struct FlakyStore {
        inner: MemorySessionStore,
        fail_first: u32,
        calls: AtomicU32,
        hang: bool,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl FlakyStore {
        fn new(fail_first: u32) -> Self {
            Self {
                inner: MemorySessionStore::new(Duration::from_secs(300)),
                fail_first,
                calls: AtomicU32::new(0),
                hang: false,
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
            }
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }

        async fn gate(&self) -> Result<()> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            let _ = self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            if self.hang {
                std::future::pending::<()>().await;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
            let _ = self.in_flight.fetch_sub(1, Ordering::SeqCst);
            if n < self.fail_first {
                Err(StoreError::Unavailable("connection refused".into()))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl SessionStore for FlakyStore {
        async fn save(&self, session: &Session) -> Result<()> {
            self.gate().await?;
            self.inner.save(session).await
        }
        async fn load(&self, id: &SessionId) -> Result<Session> {
            self.gate().await?;
            self.inner.load(id).await
        }
        async fn claim(&self, id: &SessionId, inst: &InstanceId, epoch: u64) -> Result<ClaimOutcome> {
            self.gate().await?;
            self.inner.claim(id, inst, epoch).await
        }
        async fn touch(&self, id: &SessionId) -> Result<()> {
            self.gate().await?;
            self.inner.touch(id).await
        }
        async fn expire_sweep(&self) -> Result<Vec<SessionId>> {
            self.gate().await?;
            self.inner.expire_sweep().await
        }
        async fn remove(&self, id: &SessionId) -> Result<bool> {
            self.gate().await?;
            self.inner.remove(id).await
        }
    }

    fn config() -> ResilienceConfig {
        ResilienceConfig {
            op_timeout: Duration::from_millis(500),
            retry: RetryConfig {
                max_retries: 3,
                base_delay_ms: 10,
                max_delay_ms: 100,
                jitter_factor: 0.0,
            },
            max_in_flight: 4,
            breaker_failure_threshold: 10,
            breaker_cooldown: Duration::from_secs(5),
        }
    }

    fn session(id: &str) -> Session {
        Session::new(id.into(), "u".into(), "t".into(), "inst_a".into(), Utc::now())
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried() {
        let store = ResilientStore::new(FlakyStore::new(2), config());
        store.save(&session("s1")).await.unwrap();
        assert_eq!(store.inner().calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_become_unavailable() {
        let store = ResilientStore::new(FlakyStore::new(100), config());
        let err = store.save(&session("s1")).await.unwrap_err();
        assert_matches!(err, StoreError::Unavailable(_));
        // first attempt plus max_retries
        assert_eq!(store.inner().calls(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn not_found_is_not_retried() {
        let store = ResilientStore::new(FlakyStore::new(0), config());
        assert_matches!(store.load(&"nope".into()).await, Err(StoreError::NotFound(_)));
        assert_eq!(store.inner().calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn fenced_is_not_retried() {
        let store = ResilientStore::new(FlakyStore::new(0), config());
        let s = session("s1");
        store.save(&s).await.unwrap();
        let _ = store.claim(&"s1".into(), &"inst_b".into(), 2).await.unwrap();
        let before = store.inner().calls();
        assert_matches!(store.save(&s).await, Err(StoreError::Fenced { .. }));
        assert_eq!(store.inner().calls(), before + 1);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_store_times_out() {
        let mut flaky = FlakyStore::new(0);
        flaky.hang = true;
        let store = ResilientStore::new(flaky, config());
        let err = store.touch(&"s1".into()).await.unwrap_err();
        assert_matches!(err, StoreError::Unavailable(msg) if msg.contains("timed out"));
    }

    #[tokio::test(start_paused = true)]
    async fn breaker_opens_then_recovers() {
        let cfg = ResilienceConfig {
            breaker_failure_threshold: 2,
            retry: RetryConfig {
                max_retries: 0,
                ..config().retry
            },
            ..config()
        };
        let store = ResilientStore::new(FlakyStore::new(2), cfg);

        assert!(store.save(&session("s1")).await.is_err());
        assert!(store.save(&session("s1")).await.is_err());
        assert_eq!(store.circuit_state(), CircuitState::Open);

        // short-circuited: the inner store is not called
        assert_matches!(store.save(&session("s1")).await, Err(StoreError::CircuitOpen));
        assert_eq!(store.inner().calls(), 2);

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(store.circuit_state(), CircuitState::HalfOpen);
        store.save(&session("s1")).await.unwrap();
        assert_eq!(store.circuit_state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn bulkhead_limits_concurrency() {
        let cfg = ResilienceConfig {
            max_in_flight: 2,
            ..config()
        };
        let store = Arc::new(ResilientStore::new(FlakyStore::new(0), cfg));
        let tasks: Vec<_> = (0..8)
            .map(|i| {
                let store = Arc::clone(&store);
                tokio::spawn(async move { store.save(&session(&format!("s{i}"))).await })
            })
            .collect();
        for t in tasks {
            t.await.unwrap().unwrap();
        }
        assert_eq!(store.inner().max_in_flight.load(Ordering::SeqCst), 2);
    }
}
