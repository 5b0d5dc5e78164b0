use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::time::Instant;
use uuid::Uuid;

use crate::config::BackoffPolicy;
use crate::error::{FleetError, Result};
use crate::fleet::sessions::HeartbeatAck;
use crate::fleet::{RegistrationRequest, RegistrationResponse};
use crate::scheduler::{ClaimOutcome, JobOutcome, ReportAck};

const DEFAULT_MAX_ATTEMPTS: u32 = 5;
const DEFAULT_FAILURE_THRESHOLD: u32 = 5;
const DEFAULT_COOLDOWN: Duration = Duration::from_secs(30);

/// The calls a bot makes against the orchestrator.
///
/// Every call is safe to repeat: registration is deduplicated by its
/// idempotency key, heartbeats are renewals, a claim repeated at capacity
/// hands back the job already held, and a repeated report is replayed.
#[async_trait]
pub trait BotTransport: Send + Sync {
    async fn register(&self, request: &RegistrationRequest) -> Result<RegistrationResponse>;

    async fn heartbeat(&self, bot_id: Uuid, session_id: Uuid) -> Result<HeartbeatAck>;

    async fn claim(&self, bot_id: Uuid, session_id: Uuid) -> Result<ClaimOutcome>;

    async fn report(
        &self,
        bot_id: Uuid,
        session_id: Uuid,
        job_id: Uuid,
        outcome: &JobOutcome,
    ) -> Result<ReportAck>;
}

/// Exponential backoff inside the server-issued envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub backoff: BackoffPolicy,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::default(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl RetryPolicy {
    /// Upper bound of the delay before retry number `attempt` (0-based):
    /// `min * 2^attempt`, capped at `max`.
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.min(32)).unwrap_or(u64::MAX);
        let ms = self
            .backoff
            .min_ms
            .saturating_mul(factor)
            .min(self.backoff.max_ms);
        Duration::from_millis(ms)
    }

    /// Delay to wait before retry `attempt`, jittered between `min` and the
    /// ceiling when the policy asks for jitter.
    pub fn delay(&self, attempt: u32) -> Duration {
        let ceiling = self.ceiling(attempt);
        if !self.backoff.jitter {
            return ceiling;
        }
        let low = self.backoff.min_ms.min(ceiling.as_millis() as u64);
        let high = ceiling.as_millis() as u64;
        Duration::from_millis(rand::thread_rng().gen_range(low..=high))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed { failures: u32 },
    Open { until: Instant },
    HalfOpen,
}

/// Consecutive-failure circuit breaker.
///
/// Opens after `failure_threshold` retryable failures in a row, rejects
/// calls for `cooldown`, then lets one trial call through; its result
/// closes or re-opens it.
#[derive(Debug)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    cooldown: Duration,
    state: Mutex<BreakerState>,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(DEFAULT_FAILURE_THRESHOLD, DEFAULT_COOLDOWN)
    }
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            cooldown,
            state: Mutex::new(BreakerState::Closed { failures: 0 }),
        }
    }

    pub fn state(&self) -> BreakerState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn allow(&self) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match *state {
            BreakerState::Closed { .. } | BreakerState::HalfOpen => true,
            BreakerState::Open { until } if Instant::now() >= until => {
                *state = BreakerState::HalfOpen;
                true
            }
            BreakerState::Open { .. } => false,
        }
    }

    pub fn record_success(&self) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = BreakerState::Closed { failures: 0 };
    }

    pub fn record_failure(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let open = BreakerState::Open {
            until: Instant::now() + self.cooldown,
        };
        *state = match *state {
            BreakerState::Closed { failures } if failures + 1 >= self.failure_threshold => {
                tracing::warn!(failures = failures + 1, "Circuit breaker opened");
                open
            }
            BreakerState::Closed { failures } => BreakerState::Closed {
                failures: failures + 1,
            },
            BreakerState::HalfOpen | BreakerState::Open { .. } => open,
        };
    }
}

/// Wraps a [`BotTransport`] with retry-with-backoff and a circuit breaker.
///
/// Only retryable errors (unreachable store, transport failures) are
/// retried and counted against the breaker. Definitive answers such as
/// `SessionExpired` or `ClaimConflict` are returned immediately; the caller
/// decides what to do with them.
#[derive(Debug)]
pub struct ResilientClient<T> {
    inner: T,
    retry: Mutex<RetryPolicy>,
    breaker: CircuitBreaker,
}

impl<T: BotTransport> ResilientClient<T> {
    pub fn new(inner: T) -> Self {
        Self::with_policy(inner, RetryPolicy::default(), CircuitBreaker::default())
    }

    pub fn with_policy(inner: T, retry: RetryPolicy, breaker: CircuitBreaker) -> Self {
        Self {
            inner,
            retry: Mutex::new(retry),
            breaker,
        }
    }

    pub fn inner(&self) -> &T {
        &self.inner
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        *self.retry.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Adopt the backoff envelope the server handed out at registration.
    pub fn set_backoff(&self, backoff: BackoffPolicy) {
        self.retry.lock().unwrap_or_else(|e| e.into_inner()).backoff = backoff;
    }

    async fn call<R, F, Fut>(&self, name: &'static str, mut f: F) -> Result<R>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        let policy = self.retry_policy();
        let mut attempt = 0;
        loop {
            if !self.breaker.allow() {
                return Err(FleetError::CircuitOpen(name.to_string()));
            }
            match f().await {
                Ok(value) => {
                    self.breaker.record_success();
                    return Ok(value);
                }
                Err(e) if e.is_retryable() => {
                    self.breaker.record_failure();
                    attempt += 1;
                    if attempt >= policy.max_attempts {
                        tracing::warn!(call = name, attempts = attempt, error = %e, "Giving up after retries");
                        return Err(e);
                    }
                    let delay = policy.delay(attempt - 1);
                    tracing::debug!(call = name, attempt, delay_ms = delay.as_millis() as u64, error = %e, "Retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    self.breaker.record_success();
                    return Err(e);
                }
            }
        }
    }

    pub async fn register(&self, request: &RegistrationRequest) -> Result<RegistrationResponse> {
        self.call("register", || self.inner.register(request)).await
    }

    pub async fn heartbeat(&self, bot_id: Uuid, session_id: Uuid) -> Result<HeartbeatAck> {
        self.call("heartbeat", || self.inner.heartbeat(bot_id, session_id))
            .await
    }

    pub async fn claim(&self, bot_id: Uuid, session_id: Uuid) -> Result<ClaimOutcome> {
        self.call("claim", || self.inner.claim(bot_id, session_id))
            .await
    }

    pub async fn report(
        &self,
        bot_id: Uuid,
        session_id: Uuid,
        job_id: Uuid,
        outcome: &JobOutcome,
    ) -> Result<ReportAck> {
        self.call("report", || {
            self.inner.report(bot_id, session_id, job_id, outcome)
        })
        .await
    }
}
